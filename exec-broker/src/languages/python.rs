use crate::registry::{CommandTemplate, LanguageDescriptor};

pub(crate) fn descriptor() -> LanguageDescriptor {
    LanguageDescriptor::interpreted(
        "python",
        "main.py",
        CommandTemplate::new("python3", ["{source}"]),
    )
}
