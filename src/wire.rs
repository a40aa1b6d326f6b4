//! JSON-lines front door. One request object per line, one reply line per request,
//! plus `{"event": ...}` lines for dates the connection listens on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::auth::{authenticate, Role};
use crate::booking::{BookingError, BookingRepository};
use crate::limits::*;
use crate::model::*;
use crate::settings::{AccessCode, SettingsError, SettingsPatch, SystemSettings};
use crate::store::DocumentStore;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Access {
        code: AccessCode,
    },
    List {
        #[serde(default)]
        filter: ReservationFilter,
        /// Order by date and start hour instead of creation order.
        #[serde(default)]
        sorted: bool,
    },
    Get {
        id: ReservationId,
    },
    Create {
        reservation: ReservationDraft,
    },
    Update {
        id: ReservationId,
        reservation: ReservationDraft,
    },
    Delete {
        id: ReservationId,
    },
    Occupancy {
        date: NaiveDate,
    },
    GetSettings,
    UpdateSettings {
        patch: SettingsPatch,
    },
    Listen {
        date: NaiveDate,
    },
    Unlisten {
        date: NaiveDate,
    },
}

impl Request {
    fn op(&self) -> &'static str {
        match self {
            Request::Access { .. } => "access",
            Request::List { .. } => "list",
            Request::Get { .. } => "get",
            Request::Create { .. } => "create",
            Request::Update { .. } => "update",
            Request::Delete { .. } => "delete",
            Request::Occupancy { .. } => "occupancy",
            Request::GetSettings => "get_settings",
            Request::UpdateSettings { .. } => "update_settings",
            Request::Listen { .. } => "listen",
            Request::Unlisten { .. } => "unlisten",
        }
    }

    fn needs_admin(&self) -> bool {
        matches!(
            self,
            Request::Update { .. } | Request::Delete { .. } | Request::UpdateSettings { .. }
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(Value),
    Error(ErrorBody),
    Event(ReservationEvent),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<Reservation>,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] LinesCodecError),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Why a single request failed. The connection stays open.
#[derive(Debug, Error)]
enum RequestError {
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("enter an access code first")]
    Unauthenticated,
    #[error("wrong access code")]
    AccessDenied,
    #[error("admin access required")]
    Forbidden,
    #[error("too many listened dates (max {})", MAX_LISTENS_PER_CONNECTION)]
    TooManyListens,
    #[error(transparent)]
    Booking(#[from] BookingError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

impl RequestError {
    fn code(&self) -> &'static str {
        match self {
            RequestError::BadRequest(_) => "bad_request",
            RequestError::Unauthenticated => "unauthenticated",
            RequestError::AccessDenied => "access_denied",
            RequestError::Forbidden => "forbidden",
            RequestError::TooManyListens => "too_many_listens",
            RequestError::Booking(e) => e.kind(),
            RequestError::Settings(SettingsError::Invalid(_)) => "invalid_settings",
            RequestError::Settings(SettingsError::Store(_)) => "store_unavailable",
        }
    }

    fn into_reply(self) -> Reply {
        let conflict = match &self {
            RequestError::Booking(e) => e.conflict().cloned(),
            _ => None,
        };
        Reply::Error(ErrorBody {
            code: self.code(),
            message: self.to_string(),
            conflict,
        })
    }
}

/// What one connection knows about itself.
struct Session<S> {
    repo: Arc<BookingRepository<S>>,
    role: Option<Role>,
    listens: HashMap<NaiveDate, JoinHandle<()>>,
    events: mpsc::Sender<ReservationEvent>,
}

impl<S: DocumentStore + 'static> Session<S> {
    fn new(repo: Arc<BookingRepository<S>>, events: mpsc::Sender<ReservationEvent>) -> Self {
        Self {
            repo,
            role: None,
            listens: HashMap::new(),
            events,
        }
    }

    async fn handle(&mut self, request: Request) -> Result<Value, RequestError> {
        if let Request::Access { code } = request {
            return self.access(code).await;
        }
        let role = self.role.ok_or(RequestError::Unauthenticated)?;
        if request.needs_admin() && !role.can_manage() {
            return Err(RequestError::Forbidden);
        }

        let repo = &self.repo;
        match request {
            Request::Access { .. } => unreachable!("handled above"),
            Request::List { filter, sorted } => {
                let out = if sorted {
                    repo.list_sorted(&filter).await?
                } else {
                    repo.list(&filter).await?
                };
                Ok(serde_json::to_value(out).map_err(BookingError::from)?)
            }
            Request::Get { id } => {
                let found = repo.get(&id).await?;
                Ok(serde_json::to_value(found).map_err(BookingError::from)?)
            }
            Request::Create { reservation } => {
                check_text(&reservation)?;
                let created = repo.create(reservation).await?;
                Ok(serde_json::to_value(created).map_err(BookingError::from)?)
            }
            Request::Update { id, reservation } => {
                check_text(&reservation)?;
                let updated = repo.update(&id, reservation).await?;
                Ok(serde_json::to_value(updated).map_err(BookingError::from)?)
            }
            Request::Delete { id } => {
                repo.delete(&id).await?;
                Ok(json!({ "deleted": id }))
            }
            Request::Occupancy { date } => {
                let day = repo.occupancy(date).await?;
                Ok(serde_json::to_value(day).map_err(BookingError::from)?)
            }
            Request::GetSettings => {
                let settings = repo.settings().load().await?;
                Ok(settings_view(&settings, role))
            }
            Request::UpdateSettings { patch } => {
                let settings = repo.settings().update(patch).await?;
                Ok(settings_view(&settings, role))
            }
            Request::Listen { date } => self.listen(date),
            Request::Unlisten { date } => {
                self.unlisten(date).await;
                Ok(json!({ "unlisten": date }))
            }
        }
    }

    async fn access(&mut self, code: AccessCode) -> Result<Value, RequestError> {
        let settings = self.repo.settings().load().await?;
        match authenticate(code, &settings) {
            Some(role) => {
                self.role = Some(role);
                Ok(json!({ "role": role, "title": settings.title }))
            }
            None => {
                self.role = None;
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                Err(RequestError::AccessDenied)
            }
        }
    }

    fn listen(&mut self, date: NaiveDate) -> Result<Value, RequestError> {
        if !self.listens.contains_key(&date) {
            if self.listens.len() >= MAX_LISTENS_PER_CONNECTION {
                return Err(RequestError::TooManyListens);
            }
            let rx = self.repo.notify().subscribe(date);
            let handle = tokio::spawn(forward_events(rx, self.events.clone()));
            self.listens.insert(date, handle);
        }
        Ok(json!({ "listen": date }))
    }

    async fn unlisten(&mut self, date: NaiveDate) {
        if let Some(handle) = self.listens.remove(&date) {
            handle.abort();
            // The receiver is dropped once the aborted task has finished.
            let _ = handle.await;
            self.repo.notify().release(&date);
        }
    }

    async fn close(&mut self) {
        let dates: Vec<NaiveDate> = self.listens.keys().copied().collect();
        for date in dates {
            self.unlisten(date).await;
        }
    }
}

async fn forward_events(
    mut rx: broadcast::Receiver<ReservationEvent>,
    tx: mpsc::Sender<ReservationEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("listener fell behind, {n} events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn check_text(draft: &ReservationDraft) -> Result<(), RequestError> {
    let fields = [
        ("name", &draft.name, MAX_NAME_LEN),
        ("phone", &draft.phone, MAX_PHONE_LEN),
        ("purpose", &draft.purpose, MAX_PURPOSE_LEN),
    ];
    for (field, value, max) in fields {
        if let Some(v) = value
            && v.len() > max
        {
            return Err(RequestError::BadRequest(format!(
                "{field} longer than {max} bytes"
            )));
        }
    }
    Ok(())
}

/// Residents never see the codes.
fn settings_view(settings: &SystemSettings, role: Role) -> Value {
    if role.can_manage() {
        return serde_json::to_value(settings).unwrap_or(Value::Null);
    }
    json!({
        "title": settings.title,
        "maxBookingHours": settings.max_booking_hours,
        "regulations": settings.regulations,
    })
}

async fn send_reply<T>(framed: &mut Framed<T, LinesCodec>, reply: &Reply) -> Result<(), WireError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(serde_json::to_string(reply)?).await?;
    Ok(())
}

/// Serve one client until it hangs up.
pub async fn process_connection<S, T>(
    socket: T,
    repo: Arc<BookingRepository<S>>,
) -> Result<(), WireError>
where
    S: DocumentStore + 'static,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
    let mut session = Session::new(repo, event_tx);

    let result = loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => break Ok(()),
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let reply = RequestError::BadRequest(format!(
                            "line longer than {MAX_LINE_LEN} bytes"
                        ))
                        .into_reply();
                        if let Err(e) = send_reply(&mut framed, &reply).await {
                            break Err(e);
                        }
                        continue;
                    }
                    Some(Err(e)) => break Err(e.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = dispatch(&mut session, &line).await;
                if let Err(e) = send_reply(&mut framed, &reply).await {
                    break Err(e);
                }
            }
            Some(event) = event_rx.recv() => {
                if let Err(e) = send_reply(&mut framed, &Reply::Event(event)).await {
                    break Err(e);
                }
            }
        }
    };

    session.close().await;
    result
}

async fn dispatch<S: DocumentStore + 'static>(session: &mut Session<S>, line: &str) -> Reply {
    let start = Instant::now();
    let request = match serde_json::from_str::<Request>(line) {
        Ok(request) => request,
        Err(e) => {
            metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => "unknown", "status" => "bad_request")
                .increment(1);
            return RequestError::BadRequest(e.to_string()).into_reply();
        }
    };
    let op = request.op();
    let (reply, status) = match session.handle(request).await {
        Ok(value) => (Reply::Ok(value), "ok"),
        Err(e) => {
            let code = e.code();
            if let RequestError::Booking(BookingError::StoreUnavailable(ref inner)) = e {
                warn!("{op} failed: {inner}");
            } else {
                debug!("{op} refused: {e}");
            }
            (e.into_reply(), code)
        }
    };
    metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => op, "status" => status)
        .increment(1);
    metrics::histogram!(crate::observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(start.elapsed().as_secs_f64());
    reply
}
