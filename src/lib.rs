//! Text-to-3D mesh generation in Rust.
//!
//! Turns a short natural-language prompt into a triangle mesh and writes it
//! as OBJ and/or STL. The diffusion model and the latent decoder are reached
//! through the traits in [`model`]; a deterministic [`model::toy`] backend
//! drives the whole pipeline without weights.
//!
//! ## Architecture
//!
//! ```text
//! prompt → validate ─┐
//!                    ↓
//!        ModelRegistry (constructed once, shared)
//!                    ↓
//!        Sampler (Karras sigmas, guidance 15, fp16) → latent
//!                    ↓
//!        MeshDecoder (transmitter) → TriMesh
//!                    ↓
//!        AssetWriter (atomic OBJ / STL)
//!                    ↓
//!        Renderer (optional pan previews, best effort)
//! ```
//!
//! ## Modules
//!
//! - [`config`]: sampling, preview and pipeline configuration
//! - [`scheduler`]: noise schedules (Karras, linear)
//! - [`model`]: collaborator traits, model bundle, toy backend
//! - [`registry`]: construct-once model registry, device selection
//! - [`sampler`] / [`decoder`]: the two model calls with output checks
//! - [`mesh`]: triangle mesh, OBJ and STL serialization
//! - [`writer`]: artifact files and directories
//! - [`render`]: renderer trait and pan cameras
//! - [`pipeline`]: end-to-end request handling
//! - [`manager`]: resident pipeline behind an async request queue

pub mod config;
pub mod decoder;
pub mod manager;
pub mod mesh;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod render;
pub mod sampler;
pub mod scheduler;
pub mod writer;

mod error;

pub use error::{Error, Result, Stage, is_oom_error};
