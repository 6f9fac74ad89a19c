//! Bridging server session callbacks to the host session
//!
//! The server can ask a client to save its state and, when the client is
//! timebase master, to publish the musical position for each transport
//! cycle. `SessionBridge` translates both without the backend depending on
//! the host's session type.
//!
//! These entry points sit on a callback boundary invoked from foreign
//! server threads. Nothing may unwind across that boundary: a panicking
//! session implementation degrades to "event errored" or "validity bits
//! unset".

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;

use crate::server::api::{SaveEvent, SaveKind, ServerApi, ServerTransport, TransportPosition};

/// Musical position of one transport frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MusicalTime {
    pub bar: i32,
    pub beat: i32,
    pub tick: i32,
    pub beats_per_bar: f32,
    pub beat_type: f32,
    pub ticks_per_beat: f64,
    pub beats_per_minute: f64,
}

/// The host application's session, as far as this backend is concerned
pub trait SessionHandle: Send + Sync {
    /// Persist the session under `snapshot`, either as a full state save or
    /// as a reusable template
    fn save_state(&self, snapshot: &str, template: bool) -> anyhow::Result<()>;

    /// Terminate the session (after a save-and-quit request)
    fn quit(&self);

    /// Musical position at `frame`, or `None` when the tempo map cannot
    /// answer
    fn musical_time_at(&self, frame: u64) -> Option<MusicalTime>;
}

/// Narrow adapter between server session callbacks and a [`SessionHandle`]
pub struct SessionBridge {
    session: Arc<dyn SessionHandle>,
}

impl SessionBridge {
    pub fn new(session: Arc<dyn SessionHandle>) -> Self {
        Self { session }
    }

    /// Handle a save request: save under a timestamped snapshot identifier,
    /// embed the restart command on success, always reply, and quit after
    /// replying if the request asked for it.
    pub fn handle_save_request(&self, api: &dyn ServerApi, mut event: SaveEvent) {
        let snapshot = Utc::now().format("%Y-%m-%dT%H-%M-%S").to_string();
        let template = event.kind == SaveKind::Template;

        let session = Arc::clone(&self.session);
        let saved = catch_unwind(AssertUnwindSafe(|| {
            session.save_state(&snapshot, template)
        }));

        match saved {
            Ok(Ok(())) => {
                let program = std::env::current_exe()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| "soundbridge".to_string());
                event.command_line =
                    format!("{} -U {} \"${{SESSION_DIR}}\"", program, event.client_uuid);
            }
            Ok(Err(e)) => {
                tracing::error!(snapshot = %snapshot, error = %e, "session save failed");
                event.error = true;
            }
            Err(_) => {
                tracing::error!(snapshot = %snapshot, "session save panicked");
                event.error = true;
            }
        }

        let quit_after = event.kind == SaveKind::SaveAndQuit && !event.error;
        api.session_reply(event);

        if quit_after {
            self.session.quit();
        }
    }

    /// Fill the musical fields of `pos` from the session's tempo map.
    ///
    /// On any failure the validity bit stays unset and the caller publishes
    /// a frame-only position.
    pub fn timebase_query(
        &self,
        _state: ServerTransport,
        _nframes: u32,
        pos: &mut TransportPosition,
        _new_position: bool,
    ) {
        let frame = pos.frame;
        let session = Arc::clone(&self.session);
        let musical = catch_unwind(AssertUnwindSafe(|| session.musical_time_at(frame)));

        match musical {
            Ok(Some(mt)) => {
                pos.bar = mt.bar;
                pos.beat = mt.beat;
                pos.tick = mt.tick;
                pos.beats_per_bar = mt.beats_per_bar;
                pos.beat_type = mt.beat_type;
                pos.ticks_per_beat = mt.ticks_per_beat;
                pos.beats_per_minute = mt.beats_per_minute;
                pos.has_bbt = true;
            }
            Ok(None) => {
                pos.has_bbt = false;
            }
            Err(_) => {
                pos.has_bbt = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::dummy::DummyServer;

    struct PanickingSession;

    impl SessionHandle for PanickingSession {
        fn save_state(&self, _snapshot: &str, _template: bool) -> anyhow::Result<()> {
            panic!("tempo map corrupted");
        }

        fn quit(&self) {}

        fn musical_time_at(&self, _frame: u64) -> Option<MusicalTime> {
            panic!("tempo map corrupted");
        }
    }

    #[test]
    fn panicking_save_marks_event_errored_and_replies() {
        let server = DummyServer::new(48000, 1024);
        let api = server.connector().connect("engine").unwrap();
        let bridge = SessionBridge::new(Arc::new(PanickingSession));

        let event = SaveEvent {
            kind: SaveKind::Save,
            session_dir: "/tmp/session".into(),
            client_uuid: "42".into(),
            command_line: String::new(),
            error: false,
        };
        bridge.handle_save_request(api.as_ref(), event);

        let replies = server.save_replies();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].error);
        assert!(replies[0].command_line.is_empty());
    }

    #[test]
    fn panicking_tempo_map_leaves_position_invalid() {
        let bridge = SessionBridge::new(Arc::new(PanickingSession));
        let mut pos = TransportPosition {
            frame: 4800,
            ..Default::default()
        };

        bridge.timebase_query(ServerTransport::Rolling, 1024, &mut pos, false);
        assert!(!pos.has_bbt);
        assert_eq!(pos.frame, 4800);
    }
}
