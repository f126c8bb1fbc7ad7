//! Classroom Module - Öffentliche Fassade
//!
//! `join`, `connect_to` und `leave` für ein Meeting, plus die
//! Observer-Callbacks für die UI.

mod observer;
mod orchestrator;

pub use observer::{ClassroomObserver, Connectivity};
pub use orchestrator::{ClassroomError, ConnectionOrchestrator};
