use crate::registry::{CommandTemplate, LanguageDescriptor};

/// Sources must declare `public class Main`.
pub(crate) fn descriptor() -> LanguageDescriptor {
    LanguageDescriptor::compiled(
        "java",
        "Main.java",
        "Main.class",
        CommandTemplate::new("javac", ["-d", "{workdir}", "{source}"]),
        CommandTemplate::new("java", ["-Xmx{memory_mb}m", "-cp", "{workdir}", "Main"]),
    )
    .without_address_space_limit()
}
