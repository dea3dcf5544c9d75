pub mod classify;
pub mod config;
pub mod directory;
pub mod error;
pub mod headers;
pub mod maildir;
pub mod output;
pub mod rescan;
pub mod reputation;
pub mod rewrite;

#[cfg(test)]
mod test_support;

pub use classify::{Classifier, RspamdClient, Verdict};
pub use config::Config;
pub use directory::{Directory, FilterctlClient};
pub use error::{ErrorKind, RescanError, Step};
pub use headers::RoutingContext;
pub use maildir::{MailboxResolver, MessageFile};
pub use rescan::{RescanReport, Session};
pub use reputation::{Reputation, SenderScoreResolver};
