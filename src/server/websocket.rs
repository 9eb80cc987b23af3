use crate::agent::{ ChatAgent, ImageAttachment, SendRequest, StreamEvent };
use crate::auth::User;
use crate::cli::Args;
use crate::error::ChatResult;
use crate::models::websocket::{ ClientMessage, ServerMessage };

use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::net::TcpListener;
use tokio::io::{ AsyncRead, AsyncWrite };

use tokio_tungstenite::{ accept_hdr_async, WebSocketStream };
use tokio_tungstenite::tungstenite::handshake::server::{ Request, Response, ErrorResponse };
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_rustls::TlsAcceptor;

use rustls::ServerConfig;
use rustls::pki_types::{ CertificateDer, PrivateKeyDer };
use rustls_pemfile::{ certs, pkcs8_private_keys };

use lazy_static::lazy_static;
use governor::{ RateLimiter, Quota, state::{ InMemoryState, NotKeyed }, clock::DefaultClock };

use url::form_urlencoded;

use log::{ debug, info, warn, error };
use futures::{ Sink, SinkExt, StreamExt };

pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
const CONNECTIONS_PER_SECOND: u32 = 10;

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> = RateLimiter::direct(
        Quota::per_second(NonZeroU32::new(CONNECTIONS_PER_SECOND).unwrap_or(NonZeroU32::MIN))
    );
}

pub fn load_tls_config(
    cert_path: &str,
    key_path: &str
) -> Result<Arc<ServerConfig>, Box<dyn Error + Send + Sync>> {
    let cert_file = File::open(cert_path).map_err(|e|
        format!("Failed to open TLS certificate file '{}': {}", cert_path, e)
    )?;
    let key_file = File::open(key_path).map_err(|e|
        format!("Failed to open TLS key file '{}': {}", key_path, e)
    )?;

    let mut cert_reader = BufReader::new(cert_file);
    let mut key_reader = BufReader::new(key_file);
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to read certificate(s): {}", e))?;

    let key = match pkcs8_private_keys(&mut key_reader).next() {
        Some(Ok(k)) => PrivateKeyDer::Pkcs8(k),
        Some(Err(e)) => {
            return Err(format!("Error reading private key: {}", e).into());
        }
        None => {
            return Err("No PKCS8 private key found in key file".into());
        }
    };

    let config = ServerConfig::builder().with_no_client_auth().with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

/// Connection parameters captured from the handshake query string.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConnectParams {
    pub access_token: String,
    pub conversation_id: String,
}

impl ConnectParams {
    pub fn from_query(query: &str) -> Option<Self> {
        let params: HashMap<String, String> = form_urlencoded
            ::parse(query.as_bytes())
            .into_owned()
            .collect();
        let access_token = params.get("access_token").filter(|v| !v.is_empty())?.clone();
        let conversation_id = params.get("conversation_id").filter(|v| !v.is_empty())?.clone();
        Some(Self { access_token, conversation_id })
    }
}

pub async fn start_ws_server(
    addr: &str,
    agent: Arc<ChatAgent>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;

    let tls_acceptor = if args.enable_tls {
        match (&args.tls_cert_path, &args.tls_key_path) {
            (Some(cert_path), Some(key_path)) => {
                info!(
                    "TLS enabled. Loading certificate from '{}' and key from '{}'",
                    cert_path,
                    key_path
                );
                let config = load_tls_config(cert_path, key_path)?;
                Some(TlsAcceptor::from(config))
            }
            (Some(_), None) | (None, Some(_)) => {
                error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
                return Err("Missing TLS certificate or key path".into());
            }
            (None, None) => {
                error!("--enable-tls was set but no certificate/key paths provided.");
                return Err("TLS enabled without cert/key".into());
            }
        }
    } else {
        None
    };
    let protocol = if tls_acceptor.is_some() { "WSS" } else { "WS" };
    info!("{} server listening on: {}", protocol, addr);

    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        debug!("Incoming connection from: {}", peer);
        let agent_clone = Arc::clone(&agent);
        let tls_acceptor_clone = tls_acceptor.clone();

        tokio::spawn(async move {
            let process_result = if let Some(acceptor) = tls_acceptor_clone {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => process_connection(peer, tls_stream, agent_clone).await,
                    Err(e) => {
                        error!("TLS handshake error for {}: {}", peer, e);
                        Err(Box::new(e) as Box<dyn Error + Send + Sync>)
                    }
                }
            } else {
                process_connection(peer, stream, agent_clone).await
            };

            if let Err(e) = process_result {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

fn reject(status: u16, reason: &str) -> ErrorResponse {
    let mut res = ErrorResponse::new(Some(reason.to_string()));
    *res.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode
        ::from_u16(status)
        .unwrap_or(tokio_tungstenite::tungstenite::http::StatusCode::BAD_REQUEST);
    res
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    agent: Arc<ChatAgent>
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let mut connect_params: Option<ConnectParams> = None;
    let handshake_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match ConnectParams::from_query(req.uri().query().unwrap_or("")) {
            Some(params) => {
                connect_params = Some(params);
                Ok(response)
            }
            None => Err(reject(401, "missing access_token or conversation_id")),
        }
    };

    let mut ws = match accept_hdr_async(stream, handshake_callback).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            return Err(Box::new(e));
        }
    };
    let params = connect_params.ok_or("handshake finished without connection parameters")?;

    let user = match authorize(&agent, &params).await {
        Ok(user) => user,
        Err(e) => {
            warn!("Rejecting WebSocket session from {}: {}", peer, e);
            send_frame(&mut ws, &(ServerMessage::Error { message: e.to_string() })).await;
            let _ = ws.close(None).await;
            return Ok(());
        }
    };

    handle_connection(peer, ws, agent, user, params.conversation_id).await;
    Ok(())
}

async fn authorize(agent: &ChatAgent, params: &ConnectParams) -> ChatResult<User> {
    let user = agent.authenticate(&params.access_token).await?;
    agent.owned_conversation(&user, &params.conversation_id).await?;
    Ok(user)
}

async fn send_frame<T>(tx: &mut T, msg: &ServerMessage) -> bool
    where T: Sink<Message> + Unpin, T::Error: std::fmt::Display
{
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize server frame: {}", e);
            return false;
        }
    };
    match tx.send(Message::Text(json)).await {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to send frame: {}", e);
            false
        }
    }
}

fn to_request(content: String, image: Option<crate::models::websocket::ImageUpload>, model: Option<String>) -> ChatResult<SendRequest> {
    let image = image.as_ref().map(ImageAttachment::from_upload).transpose()?;
    Ok(SendRequest { text: content, image, model })
}

pub async fn handle_connection<S>(
    peer: SocketAddr,
    websocket: WebSocketStream<S>,
    agent: Arc<ChatAgent>,
    user: User,
    conversation_id: String
)
    where S: AsyncRead + AsyncWrite + Unpin
{
    info!("User {} connected from {} to conversation {}", user.id, peer, conversation_id);

    let (mut tx, mut rx) = websocket.split();

    while let Some(msg) = rx.next().await {
        let message = match msg {
            Ok(message) => message,
            Err(e) => {
                error!("Error receiving message from {}: {}", peer, e);
                break;
            }
        };

        if message.len() > MAX_MESSAGE_SIZE {
            warn!("Message from {} exceeds size limit ({} > {})", peer, message.len(), MAX_MESSAGE_SIZE);
            send_frame(&mut tx, &(ServerMessage::Error { message: "Message too large".to_string() })).await;
            break;
        }

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => {
                break;
            }
            _ => {
                continue;
            }
        };

        let (content, image, model) = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Chat { content, image, model }) => (content, image, model),
            Err(e) => {
                warn!("Invalid frame from {}: {}", peer, e);
                let error = ServerMessage::Error { message: format!("Invalid message: {}", e) };
                if !send_frame(&mut tx, &error).await {
                    break;
                }
                continue;
            }
        };

        if !send_frame(&mut tx, &ServerMessage::Processing).await {
            break;
        }

        let request = match to_request(content, image, model) {
            Ok(request) => request,
            Err(e) => {
                if !send_frame(&mut tx, &(ServerMessage::Error { message: e.to_string() })).await {
                    break;
                }
                continue;
            }
        };

        let (events_tx, mut events_rx) = mpsc::channel::<StreamEvent>(64);
        let turn = agent.send_message_stream(&user, &conversation_id, request, events_tx);
        let forward = async {
            let mut open = true;
            while let Some(event) = events_rx.recv().await {
                if !open {
                    continue;
                }
                let frame = match event {
                    StreamEvent::UserMessage(message) => ServerMessage::UserMessage { message },
                    StreamEvent::Chunk(content) => ServerMessage::Chunk { content },
                };
                open = send_frame(&mut tx, &frame).await;
            }
            open
        };
        let (outcome, open) = tokio::join!(turn, forward);
        if !open {
            break;
        }

        let frames = match outcome {
            Ok(outcome) => {
                let mut frames: Vec<ServerMessage> = outcome.notices
                    .into_iter()
                    .map(|message| ServerMessage::Notice { message })
                    .collect();
                frames.push(ServerMessage::Response { message: outcome.assistant_message });
                frames
            }
            Err(e) => {
                error!("Error processing message from {}: {}", peer, e);
                vec![ServerMessage::Error { message: e.to_string() }]
            }
        };
        let mut open = true;
        for frame in &frames {
            if !send_frame(&mut tx, frame).await {
                open = false;
                break;
            }
        }
        if !open {
            break;
        }
    }

    info!("Connection closed: {}", peer);
}
