//! flux-plugin daemon library
//!
//! Core of a pipe-driven image generation plugin:
//! - Framed JSON command transport and dispatch
//! - NIM, InvokeAI and ComfyUI backends behind one trait
//! - Execution monitoring for ComfyUI's websocket event stream
//! - Local NIM container control and background job tracking

pub mod backend;
pub mod commands;
pub mod config;
pub mod container;
pub mod desktop;
pub mod error;
pub mod gallery;
pub mod generation;
pub mod http;
pub mod image_prep;
pub mod monitor;
pub mod plugin;
pub mod router;
pub mod storage;
pub mod supervisor;
pub mod transport;
pub mod workflow;
