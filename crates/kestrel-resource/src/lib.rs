//! User-managed Kubernetes resources
//!
//! Stored [`ResourceDefinition`]s are decoded into [`KubeResource`], a tagged
//! enum with one typed variant per supported kind, and applied with
//! server-side apply. The definition's revision is stamped on the object as
//! an annotation so that the next tick can tell whether it changed.
//!
//! [`ResourceDefinition`]: kestrel_common::ResourceDefinition

pub mod apply;
pub mod decode;

pub use apply::{apply, fetch_annotations};
pub use decode::{decode, KubeResource};
