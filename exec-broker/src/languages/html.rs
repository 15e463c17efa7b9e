use crate::registry::LanguageDescriptor;

/// Markup is echoed back by the caller; nothing runs.
pub(crate) fn descriptor() -> LanguageDescriptor {
    LanguageDescriptor::markup("html")
}
