//! keepalived notify FIFO
//!
//! keepalived writes one line per state change:
//!
//! ```text
//! INSTANCE "eth0" MASTER 254
//! GROUP "VG_1" BACKUP
//! ```
//!
//! Operators inject a takeover through the same FIFO with
//! `INSTANCE "eth0" forcetakeover`, so it queues behind whatever the
//! running engine is doing.
//!
//! Every INSTANCE state line updates the role table. INSTANCE lines with a
//! MASTER or BACKUP state become role events only while events are not
//! paused; a forcetakeover is always delivered. Paused lines are still read
//! so the FIFO never backs up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;

use super::errors::{VrrpError, VrrpResult};
use super::roles::RoleTable;
use super::RoleEventSink;
use crate::failover::{EventKind, VrrpState};
use crate::observability::{log_event, Event};

const REOPEN_DELAY: Duration = Duration::from_millis(250);

/// What a notification line is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Instance,
    Group,
}

/// What a notification line announces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announcement {
    /// keepalived entered a VRRP state
    State(VrrpState),
    /// An operator asked this controller to take over
    ForceTakeover,
}

/// One parsed FIFO line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub scope: Scope,
    pub name: String,
    pub announcement: Announcement,
    pub priority: Option<u8>,
}

impl Notification {
    /// The role event this line asks for, if any.
    pub fn event_kind(&self) -> Option<EventKind> {
        match (self.scope, self.announcement) {
            (Scope::Instance, Announcement::State(VrrpState::Master)) => Some(EventKind::Master),
            (Scope::Instance, Announcement::State(VrrpState::Backup)) => Some(EventKind::Backup),
            (Scope::Instance, Announcement::ForceTakeover) => Some(EventKind::ForceTakeover),
            _ => None,
        }
    }

    /// The VRRP state this line reports, if it reports one.
    pub fn state(&self) -> Option<VrrpState> {
        match self.announcement {
            Announcement::State(state) => Some(state),
            Announcement::ForceTakeover => None,
        }
    }
}

/// Render the FIFO line that asks the reader to deliver `kind`.
pub fn format_line(ifname: &str, kind: EventKind) -> String {
    format!("INSTANCE \"{}\" {}\n", ifname, kind.as_str())
}

/// Write one event line into the FIFO of a running reader.
///
/// Opening a FIFO blocks until someone reads it, so the open is bounded by
/// `wait`.
pub async fn inject(path: &Path, ifname: &str, kind: EventKind, wait: Duration) -> VrrpResult<()> {
    let mut opts = tokio::fs::OpenOptions::new();
    opts.append(true);
    let open = opts.open(path);
    let mut fifo = tokio::time::timeout(wait, open)
        .await
        .map_err(|_| VrrpError::NoReader(path.to_path_buf()))??;

    fifo.write_all(format_line(ifname, kind).as_bytes()).await?;
    fifo.flush().await?;
    Ok(())
}

/// Parse one FIFO line.
pub fn parse_line(line: &str) -> VrrpResult<Notification> {
    let malformed = || VrrpError::Malformed(line.to_string());
    let mut fields = line.split_whitespace();

    let scope = match fields.next() {
        Some("INSTANCE") => Scope::Instance,
        Some("GROUP") => Scope::Group,
        _ => return Err(malformed()),
    };

    let name = fields
        .next()
        .map(|n| n.trim_matches('"'))
        .filter(|n| !n.is_empty())
        .ok_or_else(malformed)?
        .to_string();

    let announcement = match fields.next().ok_or_else(malformed)? {
        "MASTER" => Announcement::State(VrrpState::Master),
        "BACKUP" => Announcement::State(VrrpState::Backup),
        "FAULT" => Announcement::State(VrrpState::Fault),
        t if t.eq_ignore_ascii_case("forcetakeover") => Announcement::ForceTakeover,
        _ => Announcement::State(VrrpState::Unknown),
    };

    let priority = match fields.next() {
        Some(p) => Some(p.parse().map_err(|_| malformed())?),
        None => None,
    };

    Ok(Notification {
        scope,
        name,
        announcement,
        priority,
    })
}

/// Reads the notify FIFO and feeds role events to the engine
pub struct FifoReader {
    path: PathBuf,
    roles: Arc<RoleTable>,
    sink: Arc<dyn RoleEventSink>,
}

impl FifoReader {
    pub fn new(path: impl Into<PathBuf>, roles: Arc<RoleTable>, sink: Arc<dyn RoleEventSink>) -> Self {
        Self {
            path: path.into(),
            roles,
            sink,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the FIFO until shutdown, reopening it whenever the writer goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> VrrpResult<()> {
        loop {
            let file = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                opened = tokio::fs::File::open(&self.path) => opened?,
            };
            log_event(Event::FifoOpened);

            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                consumed = self.consume(BufReader::new(file)) => {
                    let delivered = consumed?;
                    tracing::debug!(delivered, "FIFO writer closed");
                }
            }
            log_event(Event::FifoClosed);

            tokio::time::sleep(REOPEN_DELAY).await;
        }
    }

    /// Handle every line of a reader. Returns how many events were delivered.
    pub async fn consume<R>(&self, reader: R) -> VrrpResult<usize>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut delivered = 0;
        while let Some(line) = lines.next_line().await? {
            if self.handle_line(&line).await {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn handle_line(&self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return false;
        }

        let notification = match parse_line(line) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring FIFO line");
                return false;
            }
        };

        if notification.scope == Scope::Group {
            tracing::debug!(group = %notification.name, "ignoring group notification");
            return false;
        }

        if let Some(state) = notification.state() {
            self.roles.record(&notification.name, state);
        }

        let Some(kind) = notification.event_kind() else {
            tracing::debug!(
                ifname = %notification.name,
                announcement = ?notification.announcement,
                "state recorded, no event"
            );
            return false;
        };

        if self.roles.is_paused() && kind != EventKind::ForceTakeover {
            tracing::info!(ifname = %notification.name, event = kind.as_str(), "events are paused, dropping");
            log_event(Event::RoleEventDropped);
            return false;
        }

        self.sink.deliver(&notification.name, kind).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<(String, EventKind)>>);

    #[async_trait]
    impl RoleEventSink for Collect {
        async fn deliver(&self, ifname: &str, kind: EventKind) {
            self.0.lock().unwrap().push((ifname.to_string(), kind));
        }
    }

    #[test]
    fn test_parse_instance_line() {
        let n = parse_line(r#"INSTANCE "eth0" MASTER 254"#).unwrap();
        assert_eq!(n.scope, Scope::Instance);
        assert_eq!(n.name, "eth0");
        assert_eq!(n.state(), Some(VrrpState::Master));
        assert_eq!(n.priority, Some(254));
        assert_eq!(n.event_kind(), Some(EventKind::Master));
    }

    #[test]
    fn test_fault_and_group_lines_are_not_events() {
        assert_eq!(parse_line(r#"INSTANCE "eth1" FAULT 0"#).unwrap().event_kind(), None);
        assert_eq!(parse_line(r#"GROUP "VG_1" BACKUP"#).unwrap().event_kind(), None);
        assert_eq!(
            parse_line(r#"INSTANCE "eth1" STOP"#).unwrap().state(),
            Some(VrrpState::Unknown)
        );
        assert_eq!(parse_line(r#"GROUP "VG_1" forcetakeover"#).unwrap().event_kind(), None);
    }

    #[test]
    fn test_forcetakeover_line_is_an_event() {
        let n = parse_line(r#"INSTANCE "eth0" forcetakeover"#).unwrap();
        assert_eq!(n.announcement, Announcement::ForceTakeover);
        assert_eq!(n.state(), None);
        assert_eq!(n.event_kind(), Some(EventKind::ForceTakeover));

        let written = format_line("eth0", EventKind::ForceTakeover);
        assert_eq!(parse_line(written.trim()).unwrap(), n);
    }

    #[tokio::test]
    async fn test_forcetakeover_survives_pause_and_keeps_role() {
        let roles = Arc::new(RoleTable::new());
        let sink = Arc::new(Collect::default());
        let reader = FifoReader::new("/unused", Arc::clone(&roles), sink.clone());

        reader
            .consume("INSTANCE \"eth0\" BACKUP 100\n".as_bytes())
            .await
            .unwrap();
        roles.pause();
        let input = "INSTANCE \"eth0\" MASTER 254\n\
                     INSTANCE \"eth0\" forcetakeover\n";
        assert_eq!(reader.consume(input.as_bytes()).await.unwrap(), 1);

        assert_eq!(roles.get("eth0"), VrrpState::Master);
        assert_eq!(
            *sink.0.lock().unwrap(),
            vec![
                ("eth0".to_string(), EventKind::Backup),
                ("eth0".to_string(), EventKind::ForceTakeover),
            ]
        );
    }

    #[tokio::test]
    async fn test_inject_appends_line() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("notify");
        std::fs::write(&path, "INSTANCE \"eth1\" BACKUP 100\n").unwrap();

        inject(&path, "eth0", EventKind::ForceTakeover, Duration::from_secs(1))
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "INSTANCE \"eth1\" BACKUP 100\nINSTANCE \"eth0\" forcetakeover\n"
        );
    }

    #[tokio::test]
    async fn test_inject_missing_fifo_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let result = inject(
            &tmp.path().join("absent"),
            "eth0",
            EventKind::Master,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(VrrpError::Io(_))));
    }

    #[test]
    fn test_malformed_lines() {
        assert!(parse_line("hello").is_err());
        assert!(parse_line("INSTANCE").is_err());
        assert!(parse_line(r#"INSTANCE "eth0" MASTER high"#).is_err());
    }

    #[tokio::test]
    async fn test_paused_lines_update_roles_but_drop_events() {
        let roles = Arc::new(RoleTable::new());
        let sink = Arc::new(Collect::default());
        let reader = FifoReader::new("/unused", Arc::clone(&roles), sink.clone());

        let input = "INSTANCE \"eth0\" BACKUP 100\n\
                     garbage\n\
                     GROUP \"VG_1\" MASTER\n\
                     INSTANCE \"eth1\" FAULT 0\n";
        assert_eq!(reader.consume(input.as_bytes()).await.unwrap(), 1);

        roles.pause();
        let paused = "INSTANCE \"eth0\" MASTER 254\n";
        assert_eq!(reader.consume(paused.as_bytes()).await.unwrap(), 0);

        assert_eq!(roles.get("eth0"), VrrpState::Master);
        assert_eq!(roles.get("eth1"), VrrpState::Fault);
        assert_eq!(
            *sink.0.lock().unwrap(),
            vec![("eth0".to_string(), EventKind::Backup)]
        );
    }
}
