#![deny(unused_must_use)]
#![deny(rust_2018_idioms)]

pub extern crate steward_types as types;

pub mod catalogdb;
pub mod conditions;
pub mod config;
pub mod download;
pub mod executor;
pub mod probe;
pub mod receiptdb;
pub mod repo;
pub mod resolver;
pub mod selfserve;
pub mod session;

mod scripts;

pub use self::catalogdb::CatalogDb;
pub use self::conditions::Facts;
pub use self::config::{Config, Permission, Settings};
pub use self::executor::adapters::Adapters;
pub use self::repo::{FetchOutcome, Repo, RepoError};
pub use self::resolver::ResolveOutcome;
pub use self::session::{RunMode, Session, SessionOutcome};
