#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::uninlined_format_args
)]

//! Rate-limited, deduplicating message delivery for the Telegram Bot API.
//!
//! An unbounded stream of "send this message" requests is converted into a
//! compliant, ordered sequence of Bot API calls:
//!
//! - duplicate content is coalesced into an edit of the message created for
//!   the first occurrence, annotated with a running duplicate count;
//! - dispatches past the per-interval rate budget are parked and flushed on a
//!   periodic drain tick;
//! - a FIFO dispatch lock keeps cache and throttle state consistent under
//!   concurrent callers;
//! - rate-limit rejections (error code 429) are retried with bounded
//!   exponential backoff instead of being surfaced to the caller.
//!
//! ```no_run
//! use notigram::{Notifier, NotifierConfig};
//!
//! # async fn example() -> Result<(), notigram::DeliveryError> {
//! let notifier = Notifier::telegram("123:ABC", "-100200300", &NotifierConfig::default());
//! notifier.send("deploy finished").await?;
//! notifier.send("deploy finished").await?; // edits the first message in place
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logger;
pub mod message;
mod notifier;
pub mod transport;

pub use config::{CacheConfig, NotifierConfig, RetryConfig, ThrottleConfig};
pub use error::{DeliveryError, TransportError};
pub use logger::NotifyLogger;
pub use message::MessageBuilder;
pub use notifier::Notifier;
pub use transport::{HttpTransport, Transport};
