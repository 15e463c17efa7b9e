use crate::registry::{CommandTemplate, LanguageDescriptor};

pub(crate) fn descriptor() -> LanguageDescriptor {
    LanguageDescriptor::compiled(
        "swift",
        "main.swift",
        "main",
        CommandTemplate::new("swiftc", ["-O", "-o", "{artifact}", "{source}"]),
        CommandTemplate::new("{artifact}", Vec::<String>::new()),
    )
}
