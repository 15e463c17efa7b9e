//! Built-in language descriptors, one module per toolchain.

mod bash;
mod c;
mod cpp;
mod groovy;
mod html;
mod java;
mod javascript;
mod kotlin;
mod python;
mod swift;
mod typescript;

use crate::registry::LanguageDescriptor;

/// The table the service ships with
pub(crate) fn builtin() -> Vec<LanguageDescriptor> {
    vec![
        python::descriptor(),
        javascript::descriptor(),
        typescript::descriptor(),
        java::descriptor(),
        c::descriptor(),
        cpp::descriptor(),
        swift::descriptor(),
        kotlin::descriptor(),
        bash::descriptor(),
        groovy::descriptor(),
        html::descriptor(),
    ]
}
