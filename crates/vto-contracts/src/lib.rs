pub mod backends;
pub mod notify;
pub mod photos;
pub mod results;

pub use backends::BackendKind;
pub use photos::{PhotoUpload, TryOnRequest};
pub use results::{BackendResult, ErrorBody};
