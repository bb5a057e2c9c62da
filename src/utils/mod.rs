pub mod formatting;

pub use formatting::{format_tag, parse_tag, value_to_string};
