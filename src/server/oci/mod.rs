pub mod reference;

pub use oci_distribution::{ParseError, Reference};
pub use reference::{image_name, parse_image, with_name};
