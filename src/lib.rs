#![warn(clippy::all)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_long_first_doc_paragraph)]

//! An embedded, persistent key/value store in the Bitcask lineage: writes
//! are appended to immutable data files, an in-memory key directory maps
//! keys to the most recent on-disk location, and a periodic merge
//! compacts obsolete records.
//!
//! ```no_run
//! use caskdb::{Db, Options};
//!
//! let db = Db::open("/tmp/mydb", Options::new())?;
//! db.put(b"hello", b"world")?;
//! assert_eq!(db.get(b"hello")?, b"world");
//! db.close()?;
//! # Ok::<(), caskdb::Error>(())
//! ```

mod codec;
mod config;
mod datafile;
mod engine;
mod error;
mod index;
mod iter;
mod keydir;
mod merge;
mod metadata;
mod txn;

pub use config::{Config, Options};
pub use engine::{Batch, BatchEntry, Db, Stats};
pub use error::{Error, Result};
pub use iter::DbIterator;
pub use keydir::Item;
pub use txn::Transaction;
