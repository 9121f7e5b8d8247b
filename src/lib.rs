//! A Rust client for the Crunch.io analytics platform API.
//!
//! This crate implements a `scrunch`-style flow: connect to a session,
//! fetch a dataset, then manipulate its variables, exclusion filter and
//! hierarchical order through thin wrappers over the remote REST/JSON API.
//! All data lives server-side; every operation here translates into one or
//! two HTTP round-trips.
//!
//! ## Quick start
//! - Configure authentication via environment variables (`CRUNCH_URL`,
//!   `CRUNCH_API_KEY` or `CRUNCH_USERNAME`/`CRUNCH_PASSWORD`) or a
//!   `crunch.ini` file (supported in the current directory and in your home
//!   directory).
//! - Call [`Client::dataset`] with a dataset name or id.
//!
//! ```no_run
//! use anyhow::Result;
//! use scrunch::{Client, Expr, Path, Position};
//!
//! fn main() -> Result<()> {
//!     let client = Client::from_env()?;
//!     let dataset = client.dataset("Economist Survey")?;
//!
//!     // Drop test respondents from every view and calculation.
//!     dataset.exclude(Some(&Expr::var("wave").eq(0)))?;
//!
//!     // Regroup the variable hierarchy.
//!     let mut order = dataset.order()?;
//!     order.create_group(&Path::root(), "Demographics", &["age", "gender"])?;
//!     order.insert(&Path::new("| Demographics"), &["income"], Position::After("age"))?;
//!
//!     dataset.export(std::path::Path::new("survey.csv"), Default::default())?;
//!     Ok(())
//! }
//! ```
//!
//! For full usage and configuration details, see the crate README.

#![forbid(unsafe_code)]

mod client;
mod config;
mod dataset;
mod error;
mod expr;
mod order;
mod progress;
mod recode;
mod shoji;
mod util;
mod variable;

pub use client::{Client, ClientConfig, Credentials};
pub use dataset::{
    Dataset, DatasetEdit, ExportFormat, ExportOptions, ForkOptions, JoinSpec, VariableCatalog,
    VariableDef,
};
pub use error::OrderError;
pub use expr::{Expr, VariableResolver};
pub use order::{Element, Group, OrderGraph, Path, Position, VariableOrder, VariableRef};
pub use recode::{CaseRule, CategoryCombination, ResponseCombination};
pub use variable::{Category, Variable, VariableEdit};
