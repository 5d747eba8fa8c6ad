#![allow(clippy::missing_safety_doc, clippy::too_many_arguments)]
// Spinning-cube renderer: fenced command queues, swapchain lifecycle and the frame loop.

// Backend-neutral core
pub mod error;
pub mod hal;
pub mod queue;
pub mod swapchain;
pub mod upload;
pub mod frame;

// Scene, configuration and assets
pub mod adapter;
pub mod config;
pub mod scene;
pub mod shader;

// Backends
pub mod backend;
pub mod sim;
pub mod vulkan;

pub use adapter::{select_adapter, AdapterInfo, AdapterKind, AdapterRequest};
pub use backend::{create_backend, NativeWindow, NullBackend, RenderBackend};
pub use config::{BackendKind, RenderConfig};
pub use error::{RenderError, Result};
pub use frame::{FrameOutcome, FrameRenderer, FrameStats};
pub use hal::{ChainStatus, Hal, QueueKind};
pub use queue::CommandQueue;
pub use scene::Extent2D;
pub use shader::{ShaderDir, ShaderSource};
pub use swapchain::{SwapchainManager, SwapchainState};
pub use upload::{upload_buffer, upload_slice, PendingUpload};
