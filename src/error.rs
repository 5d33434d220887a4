//! One error type for the whole engine.
//!
//! Every layer (pager, tree, executor) returns the same semantic kinds, so
//! a commit that touches the journal, the page file and three btrees can
//! propagate one `Result` with `?` end to end.

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// On-disk bytes did not decode to a valid header or cell.
    /// `page` is 0 when the decoder did not know which page it was handed;
    /// callers that do know attach it with [`Error::at_page`].
    #[error("corrupt page {page}: {detail}")]
    CorruptPage { page: u32, detail: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Commit-time validation saw a page version newer than the one read.
    #[error("transaction conflict: {0}")]
    Conflict(String),

    /// Unique constraint (primary key or unique index) violated.
    #[error("duplicate key in {index}: {key}")]
    DuplicateKey { index: String, key: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// Statement inputs violate schema or SQL rules.
    #[error("validation: {0}")]
    Validation(String),

    /// Runtime cast of a parsed literal to a column type failed.
    #[error("cannot cast {from} to {to}")]
    TypeCast { from: String, to: String },

    /// Context token fired at a suspension point.
    #[error("cancelled")]
    Cancelled,

    /// Invariant failure.  Reaching this is a bug in the engine.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Attach a page number to a `CorruptPage` produced below the pager,
    /// where the decoder only sees a byte buffer.
    pub fn at_page(self, page: u32) -> Error {
        match self {
            Error::CorruptPage { page: 0, detail } => Error::CorruptPage { page, detail },
            other => other,
        }
    }

    pub(crate) fn corrupt(detail: impl Into<String>) -> Error {
        Error::CorruptPage {
            page: 0,
            detail: detail.into(),
        }
    }

    pub(crate) fn internal(detail: impl Into<String>) -> Error {
        Error::Internal(detail.into())
    }

    pub(crate) fn validation(detail: impl Into<String>) -> Error {
        Error::Validation(detail.into())
    }
}

#[test]
fn test_at_page_only_fills_unknown() {
    let e = Error::corrupt("bad type tag").at_page(7);
    match e {
        Error::CorruptPage { page, .. } => assert_eq!(page, 7),
        _ => panic!("wrong variant"),
    }
    let e = Error::CorruptPage {
        page: 3,
        detail: String::from("x"),
    }
    .at_page(7);
    match e {
        Error::CorruptPage { page, .. } => assert_eq!(page, 3),
        _ => panic!("wrong variant"),
    }
}
