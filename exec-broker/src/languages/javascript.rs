use crate::registry::{CommandTemplate, LanguageDescriptor};

pub(crate) fn descriptor() -> LanguageDescriptor {
    // V8 reserves far more address space than it uses; cap the heap instead.
    LanguageDescriptor::interpreted(
        "javascript",
        "main.js",
        CommandTemplate::new("node", ["--max-old-space-size={memory_mb}", "{source}"]),
    )
    .without_address_space_limit()
}
