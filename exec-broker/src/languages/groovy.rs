use crate::registry::{CommandTemplate, LanguageDescriptor};

pub(crate) fn descriptor() -> LanguageDescriptor {
    LanguageDescriptor::interpreted(
        "groovy",
        "main.groovy",
        CommandTemplate::new("groovy", ["{source}"]),
    )
    .without_address_space_limit()
}
