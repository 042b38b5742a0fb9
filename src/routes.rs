use std::convert::Infallible;

use log::error;
use serde::Deserialize;
use warp::http::StatusCode;
use warp::ws::Ws;
use warp::{Filter, Rejection, Reply};

use crate::auth::Identity;
use crate::error::{HubError, StorageError};
use crate::messages::{ErrorBody, HealthBody, MessageId, PageQuery, RoomId, UserId};
use crate::server::Server;
use crate::session::Session;
use crate::ws;

const MAX_BODY_BYTES: u64 = 16 * 1024;

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Deserialize)]
struct RoomName {
    name: String,
}

#[derive(Deserialize)]
struct EditedContent {
    content: String,
}

pub fn routes(server: Server) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    join_room(server.clone())
        .or(history(server.clone()))
        .or(edit_message(server.clone()))
        .or(read_receipt(server.clone()))
        .or(delete_message(server.clone()))
        .or(delete_room_messages(server.clone()))
        .or(create_room(server.clone()))
        .or(room_info(server.clone()))
        .or(rename_room(server.clone()))
        .or(delete_room(server.clone()))
        .or(add_member(server.clone()))
        .or(logout(server.clone()))
        .or(health(server))
        .recover(handle_rejection)
}

fn with_server(server: Server) -> impl Filter<Extract = (Server,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}

/// A bearer token from the `Authorization` header, or `?token=` for clients
/// that cannot set headers on a socket handshake. The header wins.
fn credential() -> impl Filter<Extract = (Option<String>,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(warp::query::<TokenQuery>())
        .map(|header: Option<String>, query: TokenQuery| match header {
            Some(value) => Some(
                value
                    .strip_prefix("Bearer ")
                    .map_or_else(|| value.clone(), str::to_string),
            ),
            None => query.token,
        })
}

fn join_room(server: Server) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("chat" / "joinRoom" / u64)
        .and(warp::get())
        .and(credential())
        .and(with_server(server))
        .and_then(authorize_join)
        .and(warp::ws())
        .map(|(server, session, identity): (Server, Session, Identity), ws: Ws| {
            ws.on_upgrade(move |socket| ws::serve(server, session, identity, socket))
        })
}

async fn authorize_join(
    room_id: u64,
    credential: Option<String>,
    server: Server,
) -> Result<(Server, Session, Identity), Rejection> {
    let mut session = Session::new(RoomId(room_id));
    let identity = server
        .authorize(&mut session, credential.as_deref())
        .await
        .map_err(warp::reject::custom)?;
    Ok((server, session, identity))
}

fn history(server: Server) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("messages" / "paginate" / "rooms" / u64)
        .and(warp::get())
        .and(warp::query::<PageQuery>())
        .and(credential())
        .and(with_server(server))
        .and_then(
            |room_id: u64, query: PageQuery, credential: Option<String>, server: Server| async move {
                server
                    .history(RoomId(room_id), credential.as_deref(), query)
                    .await
                    .map(|page| warp::reply::json(&page))
                    .map_err(warp::reject::custom)
            },
        )
}

fn edit_message(server: Server) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("messages" / u64)
        .and(warp::patch())
        .and(credential())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_server(server))
        .and_then(
            |id: u64, credential: Option<String>, body: EditedContent, server: Server| async move {
                server
                    .edit_message(MessageId(id), &body.content, credential.as_deref())
                    .await
                    .map(|message| warp::reply::json(&message))
                    .map_err(warp::reject::custom)
            },
        )
}

fn read_receipt(server: Server) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("messages" / u64 / "read")
        .and(warp::post())
        .and(credential())
        .and(with_server(server))
        .and_then(|id: u64, credential: Option<String>, server: Server| async move {
            server
                .mark_read(MessageId(id), credential.as_deref())
                .await
                .map(|message| warp::reply::json(&message))
                .map_err(warp::reject::custom)
        })
}

fn delete_message(server: Server) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("messages" / u64)
        .and(warp::delete())
        .and(credential())
        .and(with_server(server))
        .and_then(|id: u64, credential: Option<String>, server: Server| async move {
            server
                .delete_message(MessageId(id), credential.as_deref())
                .await
                .map(|()| StatusCode::NO_CONTENT)
                .map_err(warp::reject::custom)
        })
}

fn delete_room_messages(
    server: Server,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("rooms" / u64 / "messages")
        .and(warp::delete())
        .and(credential())
        .and(with_server(server))
        .and_then(|room_id: u64, credential: Option<String>, server: Server| async move {
            server
                .delete_room_messages(RoomId(room_id), credential.as_deref())
                .await
                .map(|_| StatusCode::NO_CONTENT)
                .map_err(warp::reject::custom)
        })
}

fn create_room(server: Server) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("rooms")
        .and(warp::post())
        .and(credential())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_server(server))
        .and_then(|credential: Option<String>, body: RoomName, server: Server| async move {
            server
                .create_room(&body.name, credential.as_deref())
                .await
                .map(|room| warp::reply::with_status(warp::reply::json(&room), StatusCode::CREATED))
                .map_err(warp::reject::custom)
        })
}

fn room_info(server: Server) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("rooms" / u64 / "info")
        .and(warp::get())
        .and(credential())
        .and(with_server(server))
        .and_then(|room_id: u64, credential: Option<String>, server: Server| async move {
            server
                .room_info(RoomId(room_id), credential.as_deref())
                .await
                .map(|room| warp::reply::json(&room))
                .map_err(warp::reject::custom)
        })
}

fn rename_room(server: Server) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("rooms" / u64 / "info")
        .and(warp::patch())
        .and(credential())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_server(server))
        .and_then(
            |room_id: u64, credential: Option<String>, body: RoomName, server: Server| async move {
                server
                    .rename_room(RoomId(room_id), &body.name, credential.as_deref())
                    .await
                    .map(|room| warp::reply::json(&room))
                    .map_err(warp::reject::custom)
            },
        )
}

fn delete_room(server: Server) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("rooms" / u64)
        .and(warp::delete())
        .and(credential())
        .and(with_server(server))
        .and_then(|room_id: u64, credential: Option<String>, server: Server| async move {
            server
                .delete_room(RoomId(room_id), credential.as_deref())
                .await
                .map(|()| StatusCode::NO_CONTENT)
                .map_err(warp::reject::custom)
        })
}

fn add_member(server: Server) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("rooms" / u64 / "members" / u64)
        .and(warp::post())
        .and(credential())
        .and(with_server(server))
        .and_then(
            |room_id: u64, user_id: u64, credential: Option<String>, server: Server| async move {
                server
                    .add_member(RoomId(room_id), UserId(user_id), credential.as_deref())
                    .await
                    .map(|room| warp::reply::json(&room))
                    .map_err(warp::reject::custom)
            },
        )
}

fn logout(server: Server) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("auth" / "logout")
        .and(warp::get())
        .and(credential())
        .and(with_server(server))
        .and_then(|credential: Option<String>, server: Server| async move {
            server
                .logout(credential.as_deref())
                .await
                .map(|_| StatusCode::NO_CONTENT)
                .map_err(warp::reject::custom)
        })
}

fn health(server: Server) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("health")
        .and(warp::get())
        .and(with_server(server))
        .then(|server: Server| async move {
            warp::reply::json(&HealthBody {
                status: "ok",
                active_rooms: server.active_rooms().await,
            })
        })
}

fn status_for(err: &HubError) -> StatusCode {
    match err {
        HubError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        HubError::RoomNotFound(_) | HubError::MessageNotFound(_) => StatusCode::NOT_FOUND,
        HubError::Forbidden(_) | HubError::NotMessageOwner(_) => StatusCode::FORBIDDEN,
        HubError::InvalidInput(_) | HubError::Storage(StorageError::EmptyContent) => {
            StatusCode::BAD_REQUEST
        }
        HubError::Storage(_) | HubError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if let Some(hub) = err.find::<HubError>() {
        let status = status_for(hub);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", hub);
            (status, "Internal server error".to_string())
        } else {
            (status, hub.to_string())
        }
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::MissingHeader>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidHeader>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Payload too large".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        error!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&ErrorBody { error: message }),
        status,
    ))
}
