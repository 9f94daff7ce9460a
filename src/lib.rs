// lib.rs - Workflow engine, collaborator adapters and HTTP surface
pub mod config;
pub mod db;
pub mod error;
pub mod types;
pub mod utils;
pub mod workflow;
pub mod zodiac;

// Collaborator adapters
pub mod assembler;
pub mod comfyui_client;
pub mod elevenlabs_client;
pub mod music;
pub mod ollama_client;
pub mod publish_client;
pub mod whisper_client;

pub mod handlers;
pub mod middleware;

pub use handlers::AppState;
