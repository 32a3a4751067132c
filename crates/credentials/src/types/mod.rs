pub mod errors;

pub use errors::CredentialError;

pub type CredentialResult<T> = Result<T, CredentialError>;
