//! One send/receive transaction against the target.
//!
//! A test case opens a fresh connection, walks the population's pre-phase
//! payloads, transmits the fuzzed individual, walks the post-phase, and
//! closes. Its coverage snapshot is taken lazily, once, from the channel's
//! history count; the session compares consecutive snapshots to detect new
//! edges.

use std::time::Duration;

use crate::coverage::CoverageChannel;
use crate::error::{Error, Result};
use crate::genetics::Individual;
use crate::net::{MAX_RECV, TargetConnection};
use crate::transition::TransitionPayload;
use crate::utils::sanitize_label;

/// Short pause between the last payload and the connection close, giving the
/// target time to touch the coverage map before it is read.
const SETTLE_DELAY: Duration = Duration::from_millis(10);
const OPEN_RETRY_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub struct TestCase {
    pub id: u64,
    pub name: String,
    pub individual: Individual,
    pub errors: Vec<String>,
    /// Stable label of the failure class, for the CSV rows.
    pub cause: Option<&'static str>,
    pub needed_restart: bool,
    pub exit_code: Option<i32>,
    coverage: Option<usize>,
    pub coverage_increase: bool,
    /// Whether the full transaction ran to completion.
    pub executed: bool,
}

impl TestCase {
    pub fn new(id: u64, individual: Individual) -> Self {
        let identity = individual.identity().simple().to_string();
        let name = format!(
            "{id}.{}.{}",
            sanitize_label(individual.species()),
            &identity[identity.len() - 12..],
        );
        Self {
            id,
            name,
            individual,
            errors: Vec::new(),
            cause: None,
            needed_restart: false,
            exit_code: None,
            coverage: None,
            coverage_increase: false,
            executed: false,
        }
    }

    /// The coverage history count after this case; read once, then cached.
    pub fn coverage_snapshot(&mut self, channel: &CoverageChannel) -> usize {
        match self.coverage {
            Some(count) => count,
            None => {
                let count = channel.directed_branch_coverage();
                self.coverage = Some(count);
                count
            }
        }
    }

    pub fn reported_coverage(&self) -> usize {
        self.coverage.unwrap_or(0)
    }

    pub fn add_error(&mut self, error: &Error) {
        self.errors.push(error.to_string());
    }

    /// Run the full transaction. Any propagated error means the case did not
    /// execute to completion; the session decides whether that is a crash,
    /// a retry, or noise.
    pub fn run(
        &mut self,
        conn: &mut TargetConnection,
        pre: &[TransitionPayload],
        post: &[TransitionPayload],
        recv_after_send: bool,
        post_relax: bool,
    ) -> Result<()> {
        self.open_target(conn)?;
        for payload in pre {
            transmit(conn, payload.bytes(), payload.recv_after_send(), false)?;
        }
        let body = self.individual.serialize();
        transmit(conn, &body, recv_after_send, false)?;
        for payload in post {
            transmit(conn, payload.bytes(), payload.recv_after_send(), post_relax)?;
        }
        std::thread::sleep(SETTLE_DELAY);
        conn.close();
        self.executed = true;
        Ok(())
    }

    /// Open the connection, retrying once with a small back-off before the
    /// target is presumed down.
    fn open_target(&self, conn: &mut TargetConnection) -> Result<()> {
        if conn.open().is_ok() {
            return Ok(());
        }
        std::thread::sleep(OPEN_RETRY_BACKOFF);
        conn.open()
    }
}

/// Send one payload; optionally wait for a reply. With `relax` set, errors
/// are swallowed — tear-down payloads routinely fail when the fuzzed body
/// already took the target down, and that must not mint new suspects.
fn transmit(
    conn: &mut TargetConnection,
    data: &[u8],
    receive: bool,
    relax: bool,
) -> Result<()> {
    if let Err(err) = conn.send(data) {
        if relax {
            return Ok(());
        }
        return Err(err);
    }
    if receive {
        if let Err(err) = conn.recv(MAX_RECV) {
            if relax {
                return Ok(());
            }
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    use super::TestCase;
    use crate::error::Error;
    use crate::genetics::Individual;
    use crate::net::{TargetConnection, Transport};
    use crate::packet::{FieldKind, FieldSpec, FieldValue, Packet, PacketSchema};
    use crate::rng::FuzzRng;
    use crate::transition::TransitionPayload;

    fn individual(rng: &mut FuzzRng) -> Individual {
        let schema = PacketSchema::new("probe", vec![FieldSpec::new(
            "body",
            FieldKind::Bytes,
            FieldValue::Bytes(vec![0xde, 0xad]),
        )]);
        Individual::new(Packet::from_schema(schema), rng)
    }

    fn connection(port: u16) -> TargetConnection {
        TargetConnection::new(
            "127.0.0.1",
            port,
            Transport::Tcp,
            Duration::from_millis(500),
            Duration::from_millis(200),
        )
    }

    #[test]
    fn full_transaction_sends_phases_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut bytes = Vec::new();
            socket.read_to_end(&mut bytes).unwrap();
            bytes
        });

        let mut rng = FuzzRng::from_seed(0);
        let mut case = TestCase::new(1, individual(&mut rng));
        let pre = vec![TransitionPayload::new("hello", vec![0x01], false)];
        let post = vec![TransitionPayload::new("bye", vec![0x02], false)];
        let mut conn = connection(port);
        case.run(&mut conn, &pre, &post, false, false).unwrap();
        assert!(case.executed);
        assert_eq!(server.join().unwrap(), vec![0x01, 0xde, 0xad, 0x02]);
    }

    #[test]
    fn expected_reply_is_awaited() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buffer = [0u8; 2];
            socket.read_exact(&mut buffer).unwrap();
            socket.write_all(b"ok").unwrap();
            let mut rest = Vec::new();
            socket.read_to_end(&mut rest).unwrap();
        });

        let mut rng = FuzzRng::from_seed(1);
        let mut case = TestCase::new(2, individual(&mut rng));
        let mut conn = connection(port);
        case.run(&mut conn, &[], &[], true, false).unwrap();
        assert!(case.executed);
        server.join().unwrap();
    }

    #[test]
    fn silent_peer_fails_the_case_when_reply_expected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = std::thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_secs(1));
            drop(socket);
        });

        let mut rng = FuzzRng::from_seed(2);
        let mut case = TestCase::new(3, individual(&mut rng));
        let mut conn = connection(port);
        let result = case.run(&mut conn, &[], &[], true, false);
        assert!(matches!(result, Err(Error::RecvTimeout)));
        assert!(!case.executed);
    }

    #[test]
    fn relaxed_post_phase_swallows_failures() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = std::thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_secs(1));
            drop(socket);
        });

        let mut rng = FuzzRng::from_seed(3);
        let mut case = TestCase::new(4, individual(&mut rng));
        // The post payload expects a reply that never comes; relax keeps the
        // case alive.
        let post = vec![TransitionPayload::new("teardown", vec![0x03], true)];
        let mut conn = connection(port);
        case.run(&mut conn, &[], &post, false, true).unwrap();
        assert!(case.executed);
    }

    #[test]
    fn unreachable_target_is_connection_failed() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut rng = FuzzRng::from_seed(4);
        let mut case = TestCase::new(5, individual(&mut rng));
        let mut conn = connection(port);
        let result = case.run(&mut conn, &[], &[], false, false);
        assert!(matches!(result, Err(Error::ConnectionFailed(_))));
        assert!(!case.executed);
    }

    #[test]
    fn case_names_are_stable_and_filesystem_safe() {
        let mut rng = FuzzRng::from_seed(5);
        let mut ind = individual(&mut rng);
        ind.set_species("IEC-104 I APDU");
        let case = TestCase::new(7, ind);
        assert!(case.name.starts_with("7.IEC-104_I_APDU."));
        assert!(!case.name.contains(' '));
    }
}
