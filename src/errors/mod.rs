mod api_errors;
mod typed_errors;

pub use typed_errors::*;
