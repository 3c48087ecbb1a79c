//! `veloxdb` is an in-process, strongly-typed object model layered over a
//! pluggable transactional storage engine. It owns the identity map between
//! in-memory entity wrappers and storage records, dirty tracking, cascade
//! deletion, inverse-reference reconciliation, and changeset serialization;
//! the storage engine itself — durability, MVCC visibility, on-disk layout —
//! is a caller-supplied [`engine::Engine`] and out of scope here. `mock_engine`
//! ships an in-memory implementation for tests and the `demos` binary.
//!
//! ## Getting started
//!
//! ```rust
//! use std::sync::Arc;
//! use veloxdb::config::SessionConfig;
//! use veloxdb::mock_engine::MockEngine;
//! use veloxdb::schema::{ClassDef, ModelBuilder, PropertyDef};
//! use veloxdb::session::ObjectModel;
//! use veloxdb::value::{PropertyValue, SimpleKind};
//!
//! let model = Arc::new(
//!     ModelBuilder::new()
//!         .class(
//!             ClassDef::new(1, "Station")
//!                 .property(PropertyDef::simple("elevation", SimpleKind::Int))
//!                 .property(PropertyDef::string("name")),
//!         )
//!         .build(),
//! );
//! let engine = MockEngine::new(model.clone());
//! let mut session = ObjectModel::open(&engine, model, SessionConfig::default()).unwrap();
//!
//! let id = session.create_object(1).unwrap();
//! session.set(id, 2, PropertyValue::Int(1200)).unwrap();
//! session.set(id, 3, PropertyValue::String("Keystone".into())).unwrap();
//! session.apply_changes().unwrap();
//! session.commit().unwrap();
//! ```

pub mod alloc;
pub mod change_list;
pub mod changeset;
pub mod collections;
pub mod config;
pub mod engine;
pub mod error;
pub mod ids;
pub mod index;
pub mod mock_engine;
pub mod object;
pub mod pool;
pub mod record;
pub mod schema;
pub mod session;
pub mod tracking;
pub mod value;

