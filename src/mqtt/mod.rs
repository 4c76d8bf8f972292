//! # Venus MQTT Integration
//!
//! Everything between the display and the Venus OS broker: connection
//! lifecycle, topic binding and the keep-alive that keeps telemetry
//! flowing.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker and keep-alive settings
//! ├── keep_alive.rs       - R/<installation>/keepalive scheduling and watchdog
//! ├── message_manager.rs  - Inbound message and poll event types
//! ├── mqtt_handler.rs     - BusSession typestate over rumqttc
//! └── topics.rs           - Placeholder topics and identifier discovery
//! ```
//!
//! ## Topic Conventions
//!
//! - `N/<installation>/<service>/<instance>/<path>` carries telemetry as
//!   `{"value": ...}`.
//! - `R/<installation>/keepalive` asks Venus to keep publishing.
//! - `W/<installation>/vebus/<id>/Mode` writes the Multiplus mode.
//!
//! The installation id (the GX serial) and the vebus instance may be left
//! as `+` in the configuration. They are then learned from the first
//! matching `N/` message and every channel waiting on them is bound and
//! subscribed.

pub mod config;
pub mod keep_alive;
pub mod message_manager;
pub mod mqtt_handler;
pub mod topics;
