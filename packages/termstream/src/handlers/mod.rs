pub mod health;
pub mod multiplexer;
pub mod sessions;

pub use health::{health_handler, metrics_handler};
pub use multiplexer::{
    attach_mux, create_mux_session, kill_mux_pane, kill_mux_session, kill_mux_window,
    list_mux_sessions,
};
pub use sessions::{
    cleanup_exited, create_session, delete_session, get_session, get_snapshot, kill_session,
    list_sessions, resize_session, send_input,
};
