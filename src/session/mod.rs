// Recording output files: naming, GPIO log, metadata and validation

pub mod gpio;
pub mod metadata;
pub mod paths;
pub mod validate;

pub use gpio::*;
pub use metadata::*;
pub use paths::*;
pub use validate::*;
