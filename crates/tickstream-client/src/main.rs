use std::fmt;
use std::io::{self, Write as _};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tickstream_proto::{
    AuthRequest, ErrorPayload, HeartbeatRequest, MessageType, PongPayload, SubscribeRequest,
    SubscriptionMode, decode_payload, decode_sync, encode_payload, encode_sync,
};

const EX_TEMPFAIL: u8 = 75;
const EX_USAGE: u8 = 64;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;

type Result<T> = std::result::Result<T, ClientError>;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = match err {
                ClientError::Usage(_) => EX_USAGE,
                ClientError::Runtime(_) => EX_TEMPFAIL,
            };
            eprintln!("tickstream-client error: {err}");
            ExitCode::from(code)
        }
    }
}

fn run() -> Result<()> {
    let args = Cli::parse(std::env::args().skip(1))?;
    run_with_cli(&args)
}

fn run_with_cli(args: &Cli) -> Result<()> {
    let addr = resolve_socket_addr(&args.server)?;
    let connect_timeout = Duration::from_secs(10);
    let mut stream = TcpStream::connect_timeout(&addr, connect_timeout)
        .map_err(|err| runtime_err(format!("failed to connect to {addr}"), err))?;
    stream.set_nodelay(true).ok();

    send_auth(&mut stream, args)?;
    expect_ack(&mut stream, "AUTH")?;

    send_subscribe(&mut stream, args)?;
    expect_ack(&mut stream, "SUBSCRIBE")?;

    let heartbeat_stream = stream
        .try_clone()
        .map_err(|err| runtime_err("failed to clone socket for heartbeat thread", err))?;
    let sequence = Arc::new(AtomicU64::new(1));
    let heartbeat_interval = Duration::from_secs(args.heartbeat_interval_secs);
    thread::spawn(move || run_heartbeat_loop(heartbeat_stream, heartbeat_interval, sequence));

    read_batches(&mut stream, args.max_batches)
}

/// Sends periodic HEARTBEAT frames on a dedicated socket clone so the main
/// thread is free to block on reads. Exits quietly once the peer closes the
/// connection (the next write fails).
fn run_heartbeat_loop(
    mut stream: TcpStream,
    interval: Duration,
    sequence: Arc<AtomicU64>,
) {
    loop {
        thread::sleep(interval);
        let request = HeartbeatRequest {
            timestamp_ms: now_ms(),
            sequence: sequence.fetch_add(1, Ordering::Relaxed),
        };
        let Ok(payload) = encode_payload(&request) else {
            return;
        };
        if encode_sync(&mut stream, MessageType::Heartbeat.as_u8(), &payload).is_err() {
            return;
        }
    }
}

fn send_auth(
    stream: &mut TcpStream,
    args: &Cli,
) -> Result<()> {
    let request = AuthRequest {
        username: args.username.clone(),
        password: args.password.clone(),
        client_id: args.client_id.clone(),
        version: Some("1.0.0".to_string()),
    };
    let payload = encode_payload(&request)
        .map_err(|err| runtime_err("failed to encode AUTH payload", err))?;
    encode_sync(stream, MessageType::Auth.as_u8(), &payload)
        .map_err(|err| runtime_err("failed to send AUTH frame", err))
}

fn send_subscribe(
    stream: &mut TcpStream,
    args: &Cli,
) -> Result<()> {
    let request = SubscribeRequest {
        mode: args.mode,
        symbols: None,
        start_time_ms: None,
        metadata: None,
    };
    let payload = encode_payload(&request)
        .map_err(|err| runtime_err("failed to encode SUBSCRIBE payload", err))?;
    encode_sync(stream, MessageType::Subscribe.as_u8(), &payload)
        .map_err(|err| runtime_err("failed to send SUBSCRIBE frame", err))
}

fn expect_ack(
    stream: &mut TcpStream,
    want: &str,
) -> Result<()> {
    let frame = decode_sync(stream).map_err(|err| runtime_err("failed to read reply frame", err))?;
    match MessageType::try_from(frame.kind) {
        Ok(MessageType::Ack) => {
            println!("{want} acknowledged");
            Ok(())
        }
        Ok(MessageType::Error) => {
            let error: ErrorPayload = decode_payload(&frame.payload)
                .map_err(|err| runtime_err("failed to decode ERROR payload", err))?;
            Err(ClientError::Runtime(format!(
                "server rejected {want}: {} ({})",
                error.code, error.message
            )))
        }
        other => Err(ClientError::Runtime(format!(
            "unexpected reply to {want}: {other:?}"
        ))),
    }
}

/// Prints each decoded DATA_BATCH (and any PONG/ERROR in between) until
/// `max_batches` have been seen, or forever if `None`.
fn read_batches(
    stream: &mut TcpStream,
    max_batches: Option<u64>,
) -> Result<()> {
    let mut seen = 0_u64;
    loop {
        let frame = decode_sync(stream).map_err(|err| runtime_err("frame decode failed", err))?;
        match MessageType::try_from(frame.kind) {
            Ok(MessageType::DataBatch) => {
                let batch: tickstream_proto::DataBatch = decode_payload(&frame.payload)
                    .map_err(|err| runtime_err("failed to decode DATA_BATCH payload", err))?;
                print_batch(&batch);
                seen += 1;
                if max_batches.is_some_and(|max| seen >= max) {
                    return Ok(());
                }
            }
            Ok(MessageType::Pong) => {
                let pong: PongPayload = decode_payload(&frame.payload)
                    .map_err(|err| runtime_err("failed to decode PONG payload", err))?;
                println!("pong: sequence={} server_ts={}", pong.sequence, pong.server_ts);
            }
            Ok(MessageType::Error) => {
                let error: ErrorPayload = decode_payload(&frame.payload)
                    .map_err(|err| runtime_err("failed to decode ERROR payload", err))?;
                return Err(ClientError::Runtime(format!(
                    "server error: {} ({})",
                    error.code, error.message
                )));
            }
            other => {
                println!("ignoring unexpected frame kind: {other:?}");
            }
        }
    }
}

fn print_batch(batch: &tickstream_proto::DataBatch) {
    println!(
        "batch #{} at {} ({} ticks{})",
        batch.batch_sequence,
        batch.batch_timestamp_ms,
        batch.ticks.len(),
        if batch.is_snapshot { ", snapshot" } else { "" }
    );
    for tick in &batch.ticks {
        println!(
            "  {} price={:.4} volume={:.2} mode={}",
            tick.symbol, tick.price, tick.volume, tick.mode
        );
    }
    let _ = io::stdout().flush();
}

fn resolve_socket_addr(server: &str) -> Result<SocketAddr> {
    server
        .to_socket_addrs()
        .map_err(|err| runtime_err(format!("failed to resolve server address: {server}"), err))?
        .next()
        .ok_or_else(|| {
            ClientError::Runtime(format!("no address resolved for server: {server}"))
        })
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[derive(Debug)]
struct Cli {
    server: String,
    username: String,
    password: String,
    client_id: Option<String>,
    mode: SubscriptionMode,
    heartbeat_interval_secs: u64,
    max_batches: Option<u64>,
}

impl Cli {
    fn parse<I>(mut args: I) -> Result<Self>
    where
        I: Iterator<Item = String>,
    {
        let mut server = None;
        let mut username = None;
        let mut password = None;
        let mut client_id = None;
        let mut mode = SubscriptionMode::Second;
        let mut heartbeat_interval_secs = DEFAULT_HEARTBEAT_INTERVAL_SECS;
        let mut max_batches = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--server" => server = args.next(),
                "--username" => username = args.next(),
                "--password" => password = args.next(),
                "--client-id" => client_id = args.next(),
                "--mode" => {
                    let raw = args.next().ok_or_else(|| {
                        ClientError::Usage("missing value for --mode".to_string())
                    })?;
                    mode = match raw.to_ascii_uppercase().as_str() {
                        "SECOND" => SubscriptionMode::Second,
                        "MINUTE" => SubscriptionMode::Minute,
                        other => {
                            return Err(ClientError::Usage(format!(
                                "--mode must be SECOND or MINUTE, got {other}"
                            )));
                        }
                    };
                }
                "--heartbeat-interval-secs" => {
                    let raw = args.next().ok_or_else(|| {
                        ClientError::Usage(
                            "missing value for --heartbeat-interval-secs".to_string(),
                        )
                    })?;
                    heartbeat_interval_secs = raw.parse::<u64>().map_err(|_| {
                        ClientError::Usage(
                            "--heartbeat-interval-secs must be a positive integer".to_string(),
                        )
                    })?;
                }
                "--max-batches" => {
                    let raw = args.next().ok_or_else(|| {
                        ClientError::Usage("missing value for --max-batches".to_string())
                    })?;
                    max_batches = Some(raw.parse::<u64>().map_err(|_| {
                        ClientError::Usage("--max-batches must be a positive integer".to_string())
                    })?);
                }
                "-h" | "--help" => {
                    return Err(ClientError::Usage(
                        "usage: tickstream-client --server host:port --username U --password P \
                         [--mode SECOND|MINUTE] [--client-id ID] \
                         [--heartbeat-interval-secs 15] [--max-batches N]"
                            .to_string(),
                    ));
                }
                other => {
                    return Err(ClientError::Usage(format!("unknown argument: {other}")));
                }
            }
        }

        Ok(Self {
            server: server
                .ok_or_else(|| ClientError::Usage("missing required argument --server".to_string()))?,
            username: username.ok_or_else(|| {
                ClientError::Usage("missing required argument --username".to_string())
            })?,
            password: password.ok_or_else(|| {
                ClientError::Usage("missing required argument --password".to_string())
            })?,
            client_id,
            mode,
            heartbeat_interval_secs,
            max_batches,
        })
    }
}

#[derive(Debug)]
enum ClientError {
    Usage(String),
    Runtime(String),
}

impl fmt::Display for ClientError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            ClientError::Usage(msg) => write!(f, "{msg}"),
            ClientError::Runtime(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

fn runtime_err(
    context: impl Into<String>,
    err: impl fmt::Display,
) -> ClientError {
    ClientError::Runtime(format!("{}: {err}", context.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parse_success_with_defaults() {
        let args = vec![
            "--server".to_string(),
            "127.0.0.1:8080".to_string(),
            "--username".to_string(),
            "ok_user".to_string(),
            "--password".to_string(),
            "ok_pass".to_string(),
        ];
        let cli = Cli::parse(args.into_iter()).expect("parse should succeed");
        assert_eq!(cli.server, "127.0.0.1:8080");
        assert_eq!(cli.heartbeat_interval_secs, DEFAULT_HEARTBEAT_INTERVAL_SECS);
        assert!(matches!(cli.mode, SubscriptionMode::Second));
        assert!(cli.max_batches.is_none());
    }

    #[test]
    fn cli_parse_accepts_minute_mode_and_max_batches() {
        let args = vec![
            "--server".to_string(),
            "127.0.0.1:8080".to_string(),
            "--username".to_string(),
            "u".to_string(),
            "--password".to_string(),
            "p".to_string(),
            "--mode".to_string(),
            "minute".to_string(),
            "--max-batches".to_string(),
            "3".to_string(),
        ];
        let cli = Cli::parse(args.into_iter()).expect("parse should succeed");
        assert!(matches!(cli.mode, SubscriptionMode::Minute));
        assert_eq!(cli.max_batches, Some(3));
    }

    #[test]
    fn cli_parse_missing_required_argument() {
        let err = Cli::parse(vec!["--username".to_string(), "u".to_string()].into_iter())
            .expect_err("parse should fail");
        match err {
            ClientError::Usage(msg) => assert!(msg.contains("--server")),
            _ => panic!("expected usage error"),
        }
    }

    #[test]
    fn cli_parse_rejects_bad_mode() {
        let args = vec![
            "--server".to_string(),
            "x:1".to_string(),
            "--username".to_string(),
            "u".to_string(),
            "--password".to_string(),
            "p".to_string(),
            "--mode".to_string(),
            "WEEKLY".to_string(),
        ];
        let err = Cli::parse(args.into_iter()).expect_err("parse should fail");
        match err {
            ClientError::Usage(msg) => assert!(msg.contains("--mode")),
            _ => panic!("expected usage error"),
        }
    }

    #[test]
    fn auth_and_subscribe_payloads_round_trip() {
        let args = Cli {
            server: "x:1".to_string(),
            username: "ok_user".to_string(),
            password: "ok_pass".to_string(),
            client_id: Some("c1".to_string()),
            mode: SubscriptionMode::Second,
            heartbeat_interval_secs: 15,
            max_batches: None,
        };
        let auth = AuthRequest {
            username: args.username.clone(),
            password: args.password.clone(),
            client_id: args.client_id.clone(),
            version: Some("1.0.0".to_string()),
        };
        let bytes = encode_payload(&auth).unwrap();
        let decoded: AuthRequest = decode_payload(&bytes).unwrap();
        assert_eq!(decoded.username, "ok_user");
        assert_eq!(decoded.client_id.as_deref(), Some("c1"));
    }
}
