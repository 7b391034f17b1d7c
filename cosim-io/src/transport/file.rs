//! File-based handoff between independent OS processes.
//!
//! For connection `name` all files live in `<working_directory>/CoSimIO_<name>/`. Each pairing of
//! two participants gets its own `session_<g>/` directory: an opening side claims the first free
//! `joined_0`/`joined_1` slot of the lowest generation `g` through an atomic no-clobber rename, so
//! the two sides of one session always agree on `g` and a resumed session never sees the files of
//! an aborted one.
//!
//! Inside a session the n-th payload sent under `identifier` is written to
//! `<identifier>.<n>.dat`; once it is complete a zero-byte `<identifier>.<n>.ready` marker appears
//! through an atomic rename. Readers gate on the marker only, never on the payload file, so a
//! partially written payload is never read. After reading, the receiver deletes both files.
//!
//! Closing the transport leaves a `session_ended` sentinel so a partner blocked in `receive`
//! fails with [`TransportError::SessionEnded`] instead of waiting for its timeout. The side that
//! closes last removes every payload nobody consumed.

use std::{
    collections::HashMap,
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use crate::{
    data::Payload,
    error::TransportError,
    settings::Settings,
    transport::{check_path_component, codec, Transport},
};

const SESSION_ENDED: &str = "session_ended";

#[derive(Debug)]
pub struct FileTransport {
    connection: String,
    dir: PathBuf,
    session_dir: PathBuf,
    slot: usize,
    poll_interval: Duration,
    timeout: Option<Duration>,
    sent: HashMap<String, u64>,
    received: HashMap<String, u64>,
    closed: bool,
}

/// Atomically create an empty file at `path`; `false` if it already exists.
fn claim(path: &Path) -> std::io::Result<bool> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let tmp = tempfile::Builder::new().prefix(".tmp").tempfile_in(dir)?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error),
    }
}

fn joined(session_dir: &Path, slot: usize) -> PathBuf {
    session_dir.join(format!("joined_{slot}"))
}

impl FileTransport {
    /// Open (creating if needed) the exchange directory of `connection` and join the first
    /// session that still waits for a participant.
    pub fn open(connection: &str, settings: &Settings) -> Result<Self, TransportError> {
        check_path_component(connection, connection)?;

        let dir = settings
            .working_directory
            .join(format!("CoSimIO_{connection}"));
        let io_err = |path: &Path, source| TransportError::Io {
            connection: connection.to_owned(),
            path: path.to_owned(),
            source,
        };

        let mut generation = 0u64;
        let (session_dir, slot) = 'join: loop {
            let session_dir = dir.join(format!("session_{generation}"));
            fs::create_dir_all(&session_dir).map_err(|e| io_err(&session_dir, e))?;
            for slot in 0..2 {
                let path = joined(&session_dir, slot);
                if claim(&path).map_err(|e| io_err(&path, e))? {
                    break 'join (session_dir, slot);
                }
            }
            generation += 1;
        };

        log::debug!("Connection \"{connection}\" joined {session_dir:?} as participant {slot}");

        Ok(Self {
            connection: connection.to_owned(),
            dir,
            session_dir,
            slot,
            poll_interval: settings.poll_interval,
            timeout: settings.timeout,
            sent: HashMap::new(),
            received: HashMap::new(),
            closed: false,
        })
    }

    /// The exchange directory of this connection.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The directory of the session this transport joined.
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    fn payload_path(&self, identifier: &str, seq: u64) -> PathBuf {
        self.session_dir.join(format!("{identifier}.{seq}.dat"))
    }

    fn marker_path(&self, identifier: &str, seq: u64) -> PathBuf {
        self.session_dir.join(format!("{identifier}.{seq}.ready"))
    }

    fn io_err(&self, path: &Path, source: std::io::Error) -> TransportError {
        TransportError::Io {
            connection: self.connection.clone(),
            path: path.to_owned(),
            source,
        }
    }

    fn persist_err(&self, path: &Path, err: tempfile::PersistError) -> TransportError {
        if err.error.kind() == std::io::ErrorKind::AlreadyExists {
            TransportError::PathCollision {
                connection: self.connection.clone(),
                identifier: path
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                path: path.to_owned(),
            }
        } else {
            self.io_err(path, err.error)
        }
    }

    /// Remove every payload and marker left in the session directory.
    fn purge(&self) -> Result<(), TransportError> {
        let entries =
            fs::read_dir(&self.session_dir).map_err(|e| self.io_err(&self.session_dir, e))?;
        let mut removed = 0;
        for entry in entries {
            let path = entry.map_err(|e| self.io_err(&self.session_dir, e))?.path();
            let stale = path
                .extension()
                .is_some_and(|ext| ext == "dat" || ext == "ready");
            if !stale {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(self.io_err(&path, e)),
            }
        }
        if removed > 0 {
            log::debug!("Removed {removed} unconsumed files from {:?}", self.session_dir);
        }
        Ok(())
    }
}

impl Transport for FileTransport {
    fn send(&mut self, identifier: &str, payload: &Payload) -> Result<(), TransportError> {
        check_path_component(&self.connection, identifier)?;

        let seq = self.sent.get(identifier).copied().unwrap_or(0);
        let payload_path = self.payload_path(identifier, seq);
        let marker_path = self.marker_path(identifier, seq);

        if payload_path.exists() || marker_path.exists() {
            return Err(TransportError::PathCollision {
                connection: self.connection.clone(),
                identifier: identifier.to_owned(),
                path: payload_path,
            });
        }

        let tmp = tempfile::Builder::new()
            .prefix(".tmp")
            .tempfile_in(&self.session_dir)
            .map_err(|e| self.io_err(&self.session_dir, e))?;
        {
            let mut w = BufWriter::new(tmp.as_file());
            codec::encode(&mut w, payload).map_err(|e| self.io_err(tmp.path(), e))?;
            w.flush().map_err(|e| self.io_err(tmp.path(), e))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| self.io_err(tmp.path(), e))?;
        tmp.persist_noclobber(&payload_path)
            .map_err(|e| self.persist_err(&payload_path, e))?;

        // payload complete, now publish the marker
        let marker = tempfile::Builder::new()
            .prefix(".tmp")
            .tempfile_in(&self.session_dir)
            .map_err(|e| self.io_err(&self.session_dir, e))?;
        marker
            .persist_noclobber(&marker_path)
            .map_err(|e| self.persist_err(&marker_path, e))?;

        self.sent.insert(identifier.to_owned(), seq + 1);
        log::trace!("Sent {:?} as {payload_path:?}", payload.kind());
        Ok(())
    }

    fn receive(&mut self, identifier: &str) -> Result<Payload, TransportError> {
        check_path_component(&self.connection, identifier)?;

        let seq = self.received.get(identifier).copied().unwrap_or(0);
        let payload_path = self.payload_path(identifier, seq);
        let marker_path = self.marker_path(identifier, seq);
        let sentinel = self.session_dir.join(SESSION_ENDED);

        let start = Instant::now();
        loop {
            // the partner publishes every marker before its sentinel
            let ended = sentinel.exists();
            if marker_path.exists() {
                break;
            }
            if ended {
                return Err(TransportError::SessionEnded {
                    connection: self.connection.clone(),
                    identifier: identifier.to_owned(),
                });
            }
            let waited = start.elapsed();
            if self.timeout.is_some_and(|timeout| waited >= timeout) {
                return Err(TransportError::Timeout {
                    connection: self.connection.clone(),
                    identifier: identifier.to_owned(),
                    waited,
                });
            }
            std::thread::sleep(self.poll_interval);
        }

        let bytes = fs::read(&payload_path).map_err(|e| self.io_err(&payload_path, e))?;
        let payload = codec::decode(&bytes).map_err(|e| TransportError::CorruptPayload {
            connection: self.connection.clone(),
            identifier: identifier.to_owned(),
            detail: format!("{e} (in {payload_path:?})"),
        })?;

        fs::remove_file(&payload_path).map_err(|e| self.io_err(&payload_path, e))?;
        fs::remove_file(&marker_path).map_err(|e| self.io_err(&marker_path, e))?;

        self.received.insert(identifier.to_owned(), seq + 1);
        log::trace!("Received {:?} from {payload_path:?}", payload.kind());
        Ok(payload)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        // take the free slot so no late participant joins a session that is over
        let partner = joined(&self.session_dir, 1 - self.slot);
        let alone = self.slot == 0 && claim(&partner).map_err(|e| self.io_err(&partner, e))?;

        let sentinel = self.session_dir.join(SESSION_ENDED);
        let first = claim(&sentinel).map_err(|e| self.io_err(&sentinel, e))?;
        if alone || !first {
            self.purge()?;
        }

        self.closed = true;
        log::debug!("Connection \"{}\" closed {:?}", self.connection, self.session_dir);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::data::{ElementType, FieldData, MeshData};

    use super::*;

    fn settings(dir: &Path, timeout_ms: u64) -> Settings {
        Settings {
            working_directory: dir.to_owned(),
            poll_interval: Duration::from_millis(1),
            timeout: Some(Duration::from_millis(timeout_ms)),
            ..Default::default()
        }
    }

    #[test_log::test]
    fn test_send_then_receive() {
        let tmp = tempfile::tempdir().unwrap();
        let mut a = FileTransport::open("fsi", &settings(tmp.path(), 1000)).unwrap();
        let mut b = FileTransport::open("fsi", &settings(tmp.path(), 1000)).unwrap();

        let field = Payload::Field(FieldData::new(vec![0.1, 0.2, 0.3]));
        a.send("Interface_force", &field).unwrap();
        a.send("Interface_force", &Payload::Field(FieldData::new(vec![1.0])))
            .unwrap();

        assert_eq!(b.receive("Interface_force").unwrap(), field);
        assert_eq!(
            b.receive("Interface_force").unwrap(),
            Payload::Field(FieldData::new(vec![1.0]))
        );

        // the receiver consumed both payloads and their markers
        assert!(!a.payload_path("Interface_force", 0).exists());
        assert!(!a.marker_path("Interface_force", 1).exists());
    }

    #[test]
    fn test_mesh_crosses() {
        let tmp = tempfile::tempdir().unwrap();
        let mut a = FileTransport::open("fsi", &settings(tmp.path(), 1000)).unwrap();
        let mut b = FileTransport::open("fsi", &settings(tmp.path(), 1000)).unwrap();

        let mesh = Payload::Mesh(MeshData::new(
            vec![[0.0; 3], [1.0, 0.0, 0.0]],
            vec![vec![0, 1]],
            vec![ElementType::Line],
        ));
        a.send("Fluid.Interface", &mesh).unwrap();
        assert_eq!(b.receive("Fluid.Interface").unwrap(), mesh);
    }

    #[test_log::test]
    fn test_receive_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let mut b = FileTransport::open("fsi", &settings(tmp.path(), 20)).unwrap();
        match b.receive("Interface_disp") {
            Err(TransportError::Timeout {
                identifier, waited, ..
            }) => {
                assert_eq!(identifier, "Interface_disp");
                assert!(waited >= Duration::from_millis(20));
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_payload_without_marker_is_invisible() {
        let tmp = tempfile::tempdir().unwrap();
        let mut b = FileTransport::open("fsi", &settings(tmp.path(), 20)).unwrap();
        // a writer that died before publishing its marker
        fs::write(b.payload_path("Interface_disp", 0), b"CSIO").unwrap();
        assert!(matches!(
            b.receive("Interface_disp"),
            Err(TransportError::Timeout { .. })
        ));
    }

    #[test]
    fn test_corrupt_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let mut b = FileTransport::open("fsi", &settings(tmp.path(), 100)).unwrap();
        fs::write(b.payload_path("Interface_disp", 0), b"CSIO\x01\x01\x05").unwrap();
        fs::write(b.marker_path("Interface_disp", 0), b"").unwrap();
        assert!(matches!(
            b.receive("Interface_disp"),
            Err(TransportError::CorruptPayload { .. })
        ));
    }

    #[test]
    fn test_session_ended() {
        let tmp = tempfile::tempdir().unwrap();
        let mut a = FileTransport::open("fsi", &settings(tmp.path(), 5000)).unwrap();
        let mut b = FileTransport::open("fsi", &settings(tmp.path(), 5000)).unwrap();

        a.send("Interface_force", &Payload::Field(FieldData::new(vec![2.0])))
            .unwrap();
        a.close().unwrap();
        a.close().unwrap();

        // pending data is still delivered before the sentinel is honoured
        assert!(b.receive("Interface_force").is_ok());
        assert!(matches!(
            b.receive("Interface_force"),
            Err(TransportError::SessionEnded { .. })
        ));
    }

    #[test]
    fn test_unconsumed_payload_collides() {
        let tmp = tempfile::tempdir().unwrap();
        let mut a = FileTransport::open("fsi", &settings(tmp.path(), 100)).unwrap();
        let field = Payload::Field(FieldData::new(vec![1.0]));
        a.send("Interface_force", &field).unwrap();

        // a second sender on the same identifier starts again at sequence 0
        let mut other = FileTransport::open("fsi", &settings(tmp.path(), 100)).unwrap();
        assert!(matches!(
            other.send("Interface_force", &field),
            Err(TransportError::PathCollision { .. })
        ));
    }

    #[test]
    fn test_last_close_removes_unconsumed_payloads() {
        let tmp = tempfile::tempdir().unwrap();
        let mut a = FileTransport::open("fsi", &settings(tmp.path(), 100)).unwrap();
        let mut b = FileTransport::open("fsi", &settings(tmp.path(), 100)).unwrap();
        a.send("Interface_force", &Payload::Field(FieldData::new(vec![999.0])))
            .unwrap();

        a.close().unwrap();
        // still deliverable to the partner after the sender ended
        assert!(a.marker_path("Interface_force", 0).exists());

        b.close().unwrap();
        assert!(!a.payload_path("Interface_force", 0).exists());
        assert!(!a.marker_path("Interface_force", 0).exists());
    }

    #[test_log::test]
    fn test_resumed_session_starts_clean() {
        let tmp = tempfile::tempdir().unwrap();
        let mut a = FileTransport::open("fsi", &settings(tmp.path(), 30)).unwrap();
        let mut b = FileTransport::open("fsi", &settings(tmp.path(), 30)).unwrap();
        a.send("Interface_force", &Payload::Field(FieldData::new(vec![999.0])))
            .unwrap();
        a.close().unwrap();
        b.close().unwrap();

        let mut a = FileTransport::open("fsi", &settings(tmp.path(), 30)).unwrap();
        let mut b = FileTransport::open("fsi", &settings(tmp.path(), 30)).unwrap();
        assert_eq!(a.session_dir(), b.session_dir());
        assert!(matches!(
            b.receive("Interface_force"),
            Err(TransportError::Timeout { .. })
        ));

        for v in [1.0, 2.0] {
            a.send("Interface_force", &Payload::Field(FieldData::new(vec![v])))
                .unwrap();
        }
        for v in [1.0, 2.0] {
            assert_eq!(
                b.receive("Interface_force").unwrap(),
                Payload::Field(FieldData::new(vec![v]))
            );
        }
    }

    #[test]
    fn test_late_joiner_skips_abandoned_session() {
        let tmp = tempfile::tempdir().unwrap();
        let mut a = FileTransport::open("fsi", &settings(tmp.path(), 30)).unwrap();
        a.send("Interface_force", &Payload::Field(FieldData::new(vec![999.0])))
            .unwrap();
        a.close().unwrap();
        assert!(!a.payload_path("Interface_force", 0).exists());

        let mut b = FileTransport::open("fsi", &settings(tmp.path(), 30)).unwrap();
        assert_ne!(a.session_dir(), b.session_dir());
        assert!(matches!(
            b.receive("Interface_force"),
            Err(TransportError::Timeout { .. })
        ));

        // the aborted side reconnects and pairs with the late joiner
        let mut a = FileTransport::open("fsi", &settings(tmp.path(), 30)).unwrap();
        assert_eq!(a.session_dir(), b.session_dir());
        a.send("Interface_force", &Payload::Field(FieldData::new(vec![1.0])))
            .unwrap();
        assert_eq!(
            b.receive("Interface_force").unwrap(),
            Payload::Field(FieldData::new(vec![1.0]))
        );
    }

    #[test]
    fn test_connections_use_disjoint_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let a = FileTransport::open("TAU", &settings(tmp.path(), 100)).unwrap();
        let b = FileTransport::open("Kratos", &settings(tmp.path(), 100)).unwrap();
        assert_ne!(a.dir(), b.dir());
    }
}
