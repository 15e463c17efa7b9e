use crate::registry::{CommandTemplate, LanguageDescriptor};

pub(crate) fn descriptor() -> LanguageDescriptor {
    LanguageDescriptor::compiled(
        "c",
        "main.c",
        "main",
        CommandTemplate::new("gcc", ["-O2", "-std=c11", "-o", "{artifact}", "{source}", "-lm"]),
        CommandTemplate::new("{artifact}", Vec::<String>::new()),
    )
}
