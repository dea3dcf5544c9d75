use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline step that was running when a rescan failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ReadMessage,
    RoutingContext,
    Classification,
    Reputation,
    AddressBook,
    ClassLookup,
    Rewrite,
    Output,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::ReadMessage => "reading message",
            Step::RoutingContext => "routing context extraction",
            Step::Classification => "classification",
            Step::Reputation => "reputation lookup",
            Step::AddressBook => "address book lookup",
            Step::ClassLookup => "class lookup",
            Step::Rewrite => "header rewrite",
            Step::Output => "writing output",
        };
        f.write_str(name)
    }
}

/// Coarse error taxonomy exposed to whatever layer invokes the rescan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Classification,
    Context,
    Reputation,
    Collaborator,
    Output,
}

#[derive(Debug, Error)]
pub enum RescanError {
    #[error("invalid account identifier: {0}")]
    InvalidAccount(String),
    #[error("failed reading directory {}: {source}", path.display())]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bad Message-Id in {}: {reason}", path.display())]
    MessageId { path: PathBuf, reason: String },
    #[error("{step} failed for {}: {source:#}", path.display())]
    Message {
        step: Step,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl RescanError {
    pub fn at(step: Step, path: impl Into<PathBuf>, source: anyhow::Error) -> Self {
        RescanError::Message {
            step,
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RescanError::InvalidAccount(_)
            | RescanError::ReadDirectory { .. }
            | RescanError::MessageId { .. } => ErrorKind::Input,
            RescanError::Message { step, .. } => match step {
                Step::ReadMessage => ErrorKind::Input,
                Step::RoutingContext | Step::Rewrite => ErrorKind::Context,
                Step::Classification => ErrorKind::Classification,
                Step::Reputation => ErrorKind::Reputation,
                Step::AddressBook | Step::ClassLookup => ErrorKind::Collaborator,
                Step::Output => ErrorKind::Output,
            },
        }
    }

    /// The failing step, when the error happened inside a per-message pipeline.
    pub fn step(&self) -> Option<Step> {
        match self {
            RescanError::Message { step, .. } => Some(*step),
            _ => None,
        }
    }
}
