mod scheduler;
pub(crate) mod utils;
