//! PTY Manager - process host for terminal sessions
//!
//! One actor per child process. Output is delivered in the order it was read
//! from the PTY master, and the exit is reported exactly once, after the
//! output that preceded it.
//!
//! # Example
//!
//! ```no_run
//! use pty_manager::{PtyActor, PtyConfig, PtyEvent};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = PtyConfig {
//!         command: "/bin/bash".to_string(),
//!         working_dir: Some("/tmp".into()),
//!         ..Default::default()
//!     };
//!
//!     let (handle, mut events) = PtyActor::spawn(config).unwrap();
//!     handle.write_str("echo hello; exit\n").await.unwrap();
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             PtyEvent::Output(out) => print!("{}", String::from_utf8_lossy(&out.data)),
//!             PtyEvent::Exited(status) => {
//!                 println!("exited: {:?}", status);
//!                 break;
//!             }
//!         }
//!     }
//! }
//! ```

mod error;
pub mod pty;

pub use error::PtyError;
pub use pty::{ExitStatus, PtyActor, PtyConfig, PtyEvent, PtyHandle, PtyOutput, PtyState};
