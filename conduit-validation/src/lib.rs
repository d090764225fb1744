//! Validation middleware for Conduit
//!
//! Rejects invalid requests with [`BusError::Validation`](conduit_core::BusError)
//! before any transaction is opened or the handler is called.
//!
//! # Examples
//!
//! ## Self-validating requests
//!
//! ```rust,ignore
//! use conduit_validation::{IsEmail, MinLength, NotEmpty, Validate, ValidationError};
//!
//! impl Validate for RegisterUser {
//!     fn validate(&self) -> Result<(), Vec<ValidationError>> {
//!         let errors: Vec<ValidationError> = [
//!             NotEmpty::validate(&self.name, "name"),
//!             MinLength(3).validate(&self.name, "name"),
//!             IsEmail::validate(&self.email, "email"),
//!         ]
//!         .into_iter()
//!         .filter_map(Result::err)
//!         .collect();
//!
//!         if errors.is_empty() { Ok(()) } else { Err(errors) }
//!     }
//! }
//!
//! let validation = ValidationMiddleware::new().validate_self::<RegisterUser>();
//! ```
//!
//! ## Field rules
//!
//! ```rust,ignore
//! use conduit_validation::{ValidationMiddleware, ValidationRules};
//!
//! let validation = ValidationMiddleware::new().rule::<RegisterUser, _>(
//!     ValidationRules::for_field("username")
//!         .not_empty()
//!         .min_length(3)
//!         .on(|cmd: &RegisterUser| cmd.username.as_str()),
//! );
//! ```

mod middleware;
mod rules;
mod traits;
mod validators;

pub use conduit_core::{ValidationError, ValidationErrors};
pub use middleware::*;
pub use rules::*;
pub use traits::*;
pub use validators::*;
