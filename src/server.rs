//! Newline-delimited JSON over TCP.
//!
//! The first frame must be `hello`. After that each line is one request,
//! answered in order by one `ok` or `error` line; `event` lines for joined
//! rooms are interleaved between replies as they arrive.

use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, NaiveTime};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::booking::{BookingError, Bookings};
use crate::fanout::ChangeEvent;
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::rooms::{ConnectionId, Registry, RoomError, RoomKey};
use crate::store::Store;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing: {0}")]
    Codec(#[from] LinesCodecError),
    #[error("encode: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Hello {
        user_id: UserId,
        role: Role,
        password: String,
    },
    Join {
        room: RoomKey,
    },
    Leave {
        room: RoomKey,
    },
    ListTables,
    UpsertTable {
        table: Table,
    },
    SetTableStatus {
        table_id: TableId,
        status: TableStatus,
    },
    CheckAvailability {
        table_id: TableId,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        #[serde(default)]
        buffer_minutes: Option<u16>,
        #[serde(default)]
        exclude: Option<ReservationId>,
    },
    AvailableTables {
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        #[serde(default)]
        party_size: Option<u32>,
        #[serde(default)]
        buffer_minutes: Option<u16>,
    },
    Create {
        reservation: ReservationRequest,
    },
    Update {
        id: ReservationId,
        #[serde(default)]
        patch: ReservationPatch,
        #[serde(default)]
        buffer_minutes: Option<u16>,
    },
    SetStatus {
        id: ReservationId,
        status: ReservationStatus,
    },
    Cancel {
        id: ReservationId,
    },
    Delete {
        id: ReservationId,
    },
    Get {
        id: ReservationId,
    },
    MyReservations {
        #[serde(default)]
        date: Option<NaiveDate>,
    },
    TableReservations {
        table_id: TableId,
        date: NaiveDate,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response<'a> {
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Error {
        code: &'static str,
        message: String,
        retryable: bool,
    },
    Event {
        event: &'a ChangeEvent,
    },
}

impl Response<'_> {
    fn ok(data: Value) -> Self {
        Response::Ok {
            data: (!data.is_null()).then_some(data),
        }
    }

    fn error(code: &'static str, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
            retryable: false,
        }
    }

    fn from_booking(e: &BookingError) -> Self {
        Response::Error {
            code: e.code(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

type Lines<T> = Framed<T, LinesCodec>;

async fn send<T>(framed: &mut Lines<T>, response: &Response<'_>) -> Result<(), ServerError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(serde_json::to_string(response)?).await?;
    Ok(())
}

/// Drive one client connection until it disconnects.
pub async fn process_connection<T, S>(
    io: T,
    bookings: Arc<Bookings<S>>,
    password: Arc<str>,
) -> Result<(), ServerError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: Store,
{
    let mut framed = Framed::new(io, LinesCodec::new_with_max_length(MAX_FRAME_LEN));

    let Some(caller) = handshake(&mut framed, &password).await? else {
        return Ok(());
    };

    let registry = bookings.fanout().registry().clone();
    let conn_id = Ulid::new();
    let outbox = registry.register(conn_id);
    tracing::debug!("connection {conn_id} is user {} ({:?})", caller.id, caller.role);

    let session = Session {
        conn_id,
        caller,
        bookings: &bookings,
        registry: &registry,
    };
    let result = session.run(&mut framed, outbox).await;

    let rooms = registry.drop_connection(conn_id);
    tracing::debug!("connection {conn_id} closed, left {rooms} room(s)");
    result
}

/// Wait for `hello` and check the shared password. `None` means the peer
/// went away or was refused; the refusal has already been sent.
async fn handshake<T>(framed: &mut Lines<T>, password: &str) -> Result<Option<Caller>, ServerError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let Some(line) = framed.next().await.transpose()? else {
        return Ok(None);
    };
    match serde_json::from_str::<Request>(&line) {
        Ok(Request::Hello {
            user_id,
            role,
            password: given,
        }) if given == password => {
            send(framed, &Response::ok(json!({ "user_id": user_id, "role": role }))).await?;
            Ok(Some(Caller::new(user_id, role)))
        }
        Ok(Request::Hello { user_id, .. }) => {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!("password authentication failed for user {user_id}");
            send(framed, &Response::error("unauthenticated", "password authentication failed")).await?;
            Ok(None)
        }
        _ => {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            send(framed, &Response::error("unauthenticated", "expected hello")).await?;
            Ok(None)
        }
    }
}

struct Session<'a, S: Store> {
    conn_id: ConnectionId,
    caller: Caller,
    bookings: &'a Bookings<S>,
    registry: &'a Registry,
}

impl<S: Store> Session<'_, S> {
    async fn run<T>(
        &self,
        framed: &mut Lines<T>,
        mut outbox: mpsc::Receiver<Arc<ChangeEvent>>,
    ) -> Result<(), ServerError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                frame = framed.next() => match frame {
                    None => return Ok(()),
                    Some(Ok(line)) => {
                        let reply = self.handle_line(&line).await;
                        send(framed, &reply).await?;
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        send(framed, &Response::error("bad_request", "frame too long")).await?;
                    }
                    Some(Err(e)) => return Err(e.into()),
                },
                event = outbox.recv() => match event {
                    Some(event) => send(framed, &Response::Event { event: &*event }).await?,
                    // Registry dropped us
                    None => return Ok(()),
                },
            }
        }
    }

    async fn handle_line(&self, line: &str) -> Response<'static> {
        let request = match serde_json::from_str::<Request>(line) {
            Ok(r) => r,
            Err(e) => return Response::error("bad_request", e.to_string()),
        };
        let label = observability::request_label(&request);
        let started = Instant::now();
        let outcome = self.dispatch(request).await;
        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "request" => label)
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(data) => {
                metrics::counter!(observability::REQUESTS_TOTAL, "request" => label, "status" => "ok").increment(1);
                Response::ok(data)
            }
            Err(e) => {
                metrics::counter!(observability::REQUESTS_TOTAL, "request" => label, "status" => e.code())
                    .increment(1);
                Response::from_booking(&e)
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Value, BookingError> {
        let b = self.bookings;
        let caller = &self.caller;
        Ok(match request {
            Request::Hello { .. } => {
                return Err(BookingError::Validation("already authenticated".into()));
            }
            Request::Join { room } => {
                self.authorize_room(room)?;
                let joined = self.registry.join(self.conn_id, room).map_err(room_error)?;
                json!({ "room": room, "joined": joined })
            }
            Request::Leave { room } => {
                let left = self.registry.leave(self.conn_id, room);
                json!({ "room": room, "left": left })
            }
            Request::ListTables => json!(b.list_tables().await?),
            Request::UpsertTable { table } => json!(b.upsert_table(caller, table).await?),
            Request::SetTableStatus { table_id, status } => {
                json!(b.set_table_status(caller, table_id, status).await?)
            }
            Request::CheckAvailability {
                table_id,
                date,
                start,
                end,
                buffer_minutes,
                exclude,
            } => {
                crate::booking::validate::window(start, end)?;
                let buffer = b.resolve_buffer(buffer_minutes)?;
                let conflict = b
                    .find_conflict(table_id, date, start, end, buffer, exclude)
                    .await?;
                json!({
                    "available": conflict.is_none(),
                    "conflict": conflict.map(|r| json!({
                        "reservation_id": r.id,
                        "start": r.start,
                        "end": r.end,
                    })),
                })
            }
            Request::AvailableTables {
                date,
                start,
                end,
                party_size,
                buffer_minutes,
            } => json!(
                b.check_availability(date, start, end, party_size, buffer_minutes)
                    .await?
            ),
            Request::Create { reservation } => json!(b.create_reservation(caller, reservation).await?),
            Request::Update {
                id,
                patch,
                buffer_minutes,
            } => json!(b.update_reservation(caller, id, patch, buffer_minutes).await?),
            Request::SetStatus { id, status } => json!(b.set_reservation_status(caller, id, status).await?),
            Request::Cancel { id } => json!(b.cancel_reservation(caller, id).await?),
            Request::Delete { id } => {
                b.delete_reservation(caller, id).await?;
                Value::Null
            }
            Request::Get { id } => json!(b.get_reservation(caller, id).await?),
            Request::MyReservations { date } => json!(b.user_reservations(caller, date).await?),
            Request::TableReservations { table_id, date } => {
                json!(b.table_reservations(caller, table_id, date).await?)
            }
        })
    }

    /// Customers see table rooms and their own reservations only.
    fn authorize_room(&self, room: RoomKey) -> Result<(), BookingError> {
        if self.caller.is_privileged() {
            return Ok(());
        }
        match room {
            RoomKey::Table(_) => Ok(()),
            RoomKey::UserReservations(user) if user == self.caller.id => Ok(()),
            RoomKey::UserReservations(_) => Err(BookingError::Forbidden("cannot watch another user's reservations")),
            RoomKey::AdminDashboard => Err(BookingError::Forbidden("admin dashboard requires staff or admin role")),
        }
    }
}

fn room_error(e: RoomError) -> BookingError {
    match e {
        RoomError::TooManyRooms(n) => BookingError::Limit {
            active: n,
            limit: MAX_ROOMS_PER_CONNECTION,
        },
        RoomError::UnknownConnection(_) => BookingError::Transient(e.to_string()),
    }
}
