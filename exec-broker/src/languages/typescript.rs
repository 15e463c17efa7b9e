use crate::registry::{CommandTemplate, LanguageDescriptor};

pub(crate) fn descriptor() -> LanguageDescriptor {
    LanguageDescriptor::compiled(
        "typescript",
        "main.ts",
        "main.js",
        CommandTemplate::new(
            "tsc",
            ["--target", "es2020", "--outDir", "{workdir}", "{source}"],
        ),
        CommandTemplate::new("node", ["--max-old-space-size={memory_mb}", "{artifact}"]),
    )
    .without_address_space_limit()
}
