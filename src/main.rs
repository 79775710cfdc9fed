//! Purpose: `ulink` CLI entry point: inspect routing keys and exercise the transport locally.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit one JSON value (or one JSON line per message) on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::{Arc, mpsc};
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use ulink::api::{
    AttributeCodec, Encoding, Error, ErrorKind, HEADER_ATTACHMENT, HashedKeyResolver, KeyResolver,
    Listener, Payload, PutOptions, SerializationHint, TlvCodec, TransportConfig, UMessage, UTransport,
    UUri, to_exit_code,
};
use ulink::local::LocalSession;

#[derive(Parser)]
#[command(
    name = "ulink",
    version,
    about = "Address-to-key resolution and loopback checks for the ulink transport",
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Transport config file (JSON)",
        value_hint = ValueHint::FilePath
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the routing key an address resolves to.
    Key {
        #[arg(help = "Address, e.g. //vehicle/body/1/door.front_left#Door")]
        uri: String,
    },
    /// Publish to a topic and print what a local subscriber receives.
    Ping {
        #[arg(help = "Topic address")]
        topic: String,
        #[arg(long, default_value_t = 1, help = "Messages to publish")]
        count: usize,
        #[arg(long, value_parser = parse_hint, help = "Serialization hint, e.g. json, protobuf, text")]
        hint: Option<SerializationHint>,
        #[arg(long, default_value = "ping", help = "Payload text")]
        data: String,
        #[arg(long, default_value_t = 2000, help = "Receive timeout per message")]
        timeout_ms: u64,
    },
    /// Send a request to a local echo responder and print the response.
    Call {
        #[arg(help = "RPC method address, e.g. //vehicle/body/1/rpc.Open")]
        method: String,
        #[arg(long, default_value = "", help = "Request payload text")]
        data: String,
        #[arg(long, value_parser = parse_hint, help = "Serialization hint")]
        hint: Option<SerializationHint>,
        #[arg(long, default_value_t = 2000, help = "Reply timeout")]
        timeout_ms: u64,
    },
    /// Print the effective transport config.
    Config,
    /// Generate shell completions.
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let code = if err.kind() == ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand {
                    2
                } else {
                    0
                };
                return Ok(code);
            }
            _ => {
                return Err(Error::new(ErrorKind::InvalidArgument)
                    .with_message(clap_error_summary(&err)));
            }
        },
    };

    let config = match &cli.config {
        Some(path) => TransportConfig::load(path)?,
        None => TransportConfig::default(),
    };

    match cli.command {
        Command::Key { uri } => {
            let address = UUri::parse(&uri)?;
            let key = HashedKeyResolver::new(config.key_prefix.clone()).resolve(&address)?;
            emit_json(&json!({
                "uri": address.to_string(),
                "key": key,
                "rpc": address.is_rpc_method(),
            }))?;
        }
        Command::Ping {
            topic,
            count,
            hint,
            data,
            timeout_ms,
        } => {
            let topic = UUri::parse(&topic)?;
            ping(config, topic, count, hint, data, Duration::from_millis(timeout_ms))?;
        }
        Command::Call {
            method,
            data,
            hint,
            timeout_ms,
        } => {
            let method = UUri::parse(&method)?;
            call(config, method, data, hint, Duration::from_millis(timeout_ms))?;
        }
        Command::Config => emit_json(&json!(config))?,
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "ulink", &mut io::stdout());
        }
    }
    Ok(0)
}

fn parse_hint(value: &str) -> Result<SerializationHint, String> {
    SerializationHint::parse(value).map_err(|err| err.to_string())
}

fn ping(
    config: TransportConfig,
    topic: UUri,
    count: usize,
    hint: Option<SerializationHint>,
    data: String,
    timeout: Duration,
) -> Result<(), Error> {
    let transport = UTransport::builder(LocalSession::new())
        .config(config)
        .build()?;
    transport.init()?;

    let (tx, rx) = mpsc::channel::<UMessage>();
    let listener: Arc<dyn Listener> = Arc::new(move |message: UMessage| -> Result<(), Error> {
        tx.send(message)
            .map_err(|_| Error::new(ErrorKind::Unavailable).with_message("ping receiver closed"))
    });
    let result = transport
        .register_listener(&topic, listener)
        .and_then(|()| ping_rounds(&transport, &topic, &rx, count, hint, &data, timeout));
    let terminated = transport.term();
    result.and(terminated)
}

fn ping_rounds(
    transport: &UTransport<LocalSession>,
    topic: &UUri,
    received: &mpsc::Receiver<UMessage>,
    count: usize,
    hint: Option<SerializationHint>,
    data: &str,
    timeout: Duration,
) -> Result<(), Error> {
    for _ in 0..count {
        let mut message = UMessage::publish(topic.clone(), Payload::owned(data.as_bytes()));
        message.attributes.serialization_hint = hint;
        transport.send(&message)?;

        let delivered = received.recv_timeout(timeout).map_err(|_| {
            Error::new(ErrorKind::Unavailable)
                .with_message("no delivery before timeout")
                .with_id(message.id())
        })?;
        if delivered.id() != message.id() {
            return Err(Error::new(ErrorKind::Internal)
                .with_message("delivery does not match the published message")
                .with_id(message.id()));
        }
        emit_json(&message_json(&delivered))?;
    }
    Ok(())
}

fn call(
    config: TransportConfig,
    method: UUri,
    data: String,
    hint: Option<SerializationHint>,
    timeout: Duration,
) -> Result<(), Error> {
    if !method.is_rpc_method() {
        return Err(Error::new(ErrorKind::InvalidArgument)
            .with_message(format!("{method} is not an rpc method address")));
    }
    let transport = UTransport::builder(LocalSession::new())
        .config(config)
        .build()?;
    transport.init()?;

    let responder = transport.clone();
    let echo: Arc<dyn Listener> = Arc::new(move |request: UMessage| -> Result<(), Error> {
        let payload = Payload::reference(request.payload.data().clone());
        let mut response = UMessage::response_to(&request, payload);
        response.attributes.serialization_hint = request.attributes.serialization_hint;
        responder.send(&response)
    });
    let result = transport
        .register_listener(&method, echo)
        .and_then(|()| call_once(&transport, &method, &data, hint, timeout));
    let terminated = transport.term();
    result.and(terminated)
}

fn call_once(
    transport: &UTransport<LocalSession>,
    method: &UUri,
    data: &str,
    hint: Option<SerializationHint>,
    timeout: Duration,
) -> Result<(), Error> {
    let mut request = UMessage::request(
        UUri::rpc_response("ulink-cli", 1),
        method.clone(),
        Payload::owned(data.as_bytes()),
    );
    request.attributes.serialization_hint = hint;
    request.attributes.ttl = u32::try_from(timeout.as_millis()).ok();

    let key = transport.resolve(method)?;
    let encoding = Encoding::from_hint(hint)?;
    let header = TlvCodec.encode(&request.attributes)?;
    let replies = transport.session().get(
        &key,
        request.payload.as_bytes(),
        PutOptions::with_header(encoding, header),
    )?;

    let reply = replies.recv_timeout(timeout).map_err(|_| {
        Error::new(ErrorKind::Unavailable)
            .with_message("no reply before timeout")
            .with_key(&key)
            .with_id(request.id())
    })?;
    let header = reply.attachment.get(HEADER_ATTACHMENT).ok_or_else(|| {
        Error::new(ErrorKind::Internal).with_message("reply carries no attribute attachment")
    })?;
    let attributes = TlvCodec.decode(header)?;
    if attributes.reqid != Some(request.id()) {
        return Err(Error::new(ErrorKind::Internal)
            .with_message("reply correlates to a different request")
            .with_id(request.id()));
    }
    debug!(id = %attributes.id, "reply received");

    let response = UMessage::new(attributes, Payload::reference(reply.payload));
    let mut value = message_json(&response);
    if let Value::Object(map) = &mut value {
        map.insert("encoding".to_string(), json!(reply.encoding.as_str()));
    }
    emit_json(&value)
}

fn message_json(message: &UMessage) -> Value {
    let attributes = &message.attributes;
    let mut map = Map::new();
    map.insert("id".to_string(), json!(attributes.id.to_string()));
    map.insert("type".to_string(), json!(attributes.message_type.as_str()));
    if let Some(source) = &attributes.source {
        map.insert("source".to_string(), json!(source.to_string()));
    }
    if let Some(sink) = &attributes.sink {
        map.insert("sink".to_string(), json!(sink.to_string()));
    }
    if let Some(reqid) = attributes.reqid {
        map.insert("reqid".to_string(), json!(reqid.to_string()));
    }
    if let Some(hint) = attributes.serialization_hint {
        map.insert("hint".to_string(), json!(format!("{hint:?}")));
    }
    map.insert(
        "payload".to_string(),
        json!(String::from_utf8_lossy(message.payload.as_bytes())),
    );
    Value::Object(map)
}

fn emit_json(value: &Value) -> Result<(), Error> {
    let json = serde_json::to_string(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("json encode failed")
            .with_source(err)
    })?;
    println!("{json}");
    Ok(())
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("error: {}", error_message(err));
        for cause in error_causes(err) {
            eprintln!("  caused by: {cause}");
        }
        return;
    }

    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::InvalidArgument => "invalid argument".to_string(),
        ErrorKind::Unavailable => "unavailable".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(key) = err.key() {
        inner.insert("key".to_string(), json!(key));
    }
    if let Some(id) = err.id() {
        inner.insert("id".to_string(), json!(id));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
