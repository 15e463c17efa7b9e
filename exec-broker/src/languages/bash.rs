use crate::registry::{CommandTemplate, LanguageDescriptor};

pub(crate) fn descriptor() -> LanguageDescriptor {
    LanguageDescriptor::interpreted("bash", "main.sh", CommandTemplate::new("bash", ["{source}"]))
}
