use crate::registry::{CommandTemplate, LanguageDescriptor};

pub(crate) fn descriptor() -> LanguageDescriptor {
    LanguageDescriptor::compiled(
        "cpp",
        "main.cpp",
        "main",
        CommandTemplate::new("g++", ["-O2", "-std=c++17", "-o", "{artifact}", "{source}"]),
        CommandTemplate::new("{artifact}", Vec::<String>::new()),
    )
}
