//! Backend of the CTO viability portal.
//!
//! The portal keeps a geocoded inventory of CTOs (fiber distribution boxes)
//! with a Supabase table as the primary store and Excel workbooks in the
//! data directory as a fallback and offline mirror. On top of the inventory
//! it manages designer accounts, tabulation labels, the sequential VI ALA
//! ledger and in-memory presence tracking.
//!
//! Module map:
//! - [`app`] routes, handlers and background tasks
//! - [`remote`] the Supabase REST client
//! - [`cto`] dataset import, export and proximity queries
//! - [`basefile`] current/backup rotation of the dataset workbook
//! - [`designers`], [`tabulations`], [`ledger`] the three small registries
//! - [`sessions`] presence tracking and the import gate
//! - [`xlsx`], [`normalize`] spreadsheet plumbing shared by all of the above

pub mod app;
pub mod basefile;
pub mod config;
pub mod cto;
pub mod designers;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod normalize;
pub mod remote;
pub mod sessions;
pub mod state;
pub mod tabulations;
pub mod xlsx;
