use crate::registry::{CommandTemplate, LanguageDescriptor};

pub(crate) fn descriptor() -> LanguageDescriptor {
    LanguageDescriptor::compiled(
        "kotlin",
        "main.kt",
        "main.jar",
        CommandTemplate::new("kotlinc", ["{source}", "-include-runtime", "-d", "{artifact}"]),
        CommandTemplate::new("java", ["-Xmx{memory_mb}m", "-jar", "{artifact}"]),
    )
    .without_address_space_limit()
}
