//! Applies patches to Kubernetes-style objects under optimistic concurrency
//! control.
//!
//! A patch request runs through the following steps:
//!
//! 1. The [`PatchType`] is negotiated from the content type of the request and
//!    a [`Mechanism`] for it is built (see [`dispatcher`]).
//! 2. A [`Patcher`] wraps the mechanism and admission control. It is handed to
//!    the [`ObjectStore`] as update callback, which calls it with the current
//!    object and retries on concurrent modifications.
//! 3. The store writes the candidate if the object didn't change in the
//!    meantime, creating it if allowed.
//!
//! The [`ResourceHandler`] drives these steps for patch and create requests.
//!
//! ```
//! use std::sync::Arc;
//!
//! use kube::core::{ApiResource, GroupVersionKind};
//! use stackable_patcher::{
//!     AlwaysAdmit, InMemoryStore, PatchOptions, PatchRequest, PatchType, PatcherOptions,
//!     ResourceHandler, ResourceScope,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let resource = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"));
//! let handler = ResourceHandler::new(
//!     ResourceScope::builder(resource.clone()).build(),
//!     Arc::new(InMemoryStore::new(resource)),
//!     Arc::new(AlwaysAdmit),
//!     PatcherOptions::default(),
//! );
//!
//! let config = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\ndata:\n  mode: fast\n";
//! let request = PatchRequest::new("settings", PatchType::Apply, config)
//!     .within("default")
//!     .with_options(PatchOptions {
//!         field_manager: Some("docs".to_owned()),
//!         ..Default::default()
//!     });
//!
//! let outcome = handler.patch_resource(request).await.unwrap();
//! assert!(outcome.created);
//! assert_eq!(outcome.object.data["data"]["mode"], "fast");
//! # }
//! ```
pub mod admission;
pub mod dispatcher;
pub mod mechanism;
pub mod store;

mod config;
mod error;
mod handler;
mod patch_type;
mod patcher;
mod request;

pub use crate::{
    admission::{AdmissionAttributes, AdmissionError, AdmissionGate, AlwaysAdmit},
    config::{PatcherOptions, PatcherOptionsBuilder},
    error::{Error, ErrorKind, Result},
    handler::{PatchOutcome, ResourceHandler},
    mechanism::Mechanism,
    patch_type::PatchType,
    patcher::Patcher,
    request::{
        CreateOptions, CreateRequest, DRY_RUN_ALL, Defaulter, PatchOptions, PatchRequest,
        RequestContext, ResourceScope, ResourceScopeBuilder, parse_timeout,
        prefix_from_user_agent,
    },
    store::{InMemoryStore, ObjectKey, ObjectStore, RetryPolicy, SkipValidation, Written},
};
