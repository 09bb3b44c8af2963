//! Built-in handler for the `frappe` application
//!
//! Puts every socket in its user room and the website room (plus `all` for
//! desk users) and lets clients follow doctypes, documents and background
//! tasks. Document and doctype subscriptions are permission-checked against
//! the backend.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use realtime_core::models::RoomName;

use super::TenantHandler;
use crate::backend::Permissions;
use crate::socket::{Socket, DISCONNECT_EVENT};

pub const APP_ID: &str = "frappe";

pub const WEBSITE_ROOM: &str = "website";
pub const ALL_ROOM: &str = "all";

#[must_use]
pub fn user_room(user: &str) -> RoomName {
    RoomName::new(format!("user:{user}"))
}

#[must_use]
pub fn doctype_room(doctype: &str) -> RoomName {
    RoomName::new(format!("doctype:{doctype}"))
}

#[must_use]
pub fn doc_room(doctype: &str, docname: &str) -> RoomName {
    RoomName::new(format!("doc:{doctype}/{docname}"))
}

#[must_use]
pub fn open_doc_room(doctype: &str, docname: &str) -> RoomName {
    RoomName::new(format!("{OPEN_DOC_PREFIX}{doctype}/{docname}"))
}

const OPEN_DOC_PREFIX: &str = "open_doc:";

/// `(doctype, docname)` of an `open_doc:` room
fn parse_open_doc_room(room: &RoomName) -> Option<(&str, &str)> {
    room.as_str().strip_prefix(OPEN_DOC_PREFIX)?.split_once('/')
}

#[must_use]
pub fn task_room(task_id: &str) -> RoomName {
    RoomName::new(format!("task_progress:{task_id}"))
}

pub struct FrappeHandler {
    permissions: Arc<dyn Permissions>,
}

impl FrappeHandler {
    pub fn new(permissions: Arc<dyn Permissions>) -> Self {
        Self { permissions }
    }
}

impl TenantHandler for FrappeHandler {
    fn install(&self, socket: &Socket) -> anyhow::Result<()> {
        socket.join(user_room(socket.user()));
        socket.join(WEBSITE_ROOM);
        if socket.auth().is_system_user() {
            socket.join(ALL_ROOM);
        }

        let permissions = self.permissions.clone();
        socket.on("doctype_subscribe", move |socket, data| {
            let permissions = permissions.clone();
            async move {
                let Some(doctype) = single_arg(&data, "doctype") else {
                    return bad_args(&socket, "doctype_subscribe", &data);
                };
                if permissions
                    .can_subscribe_doctype(&socket.auth().credentials, &doctype)
                    .await
                {
                    socket.join(doctype_room(&doctype));
                } else {
                    denied(&socket, "doctype_subscribe", &doctype);
                }
            }
        });

        socket.on("doctype_unsubscribe", |socket, data| async move {
            match single_arg(&data, "doctype") {
                Some(doctype) => {
                    socket.leave(&doctype_room(&doctype));
                }
                None => bad_args(&socket, "doctype_unsubscribe", &data),
            }
        });

        socket.on("task_subscribe", |socket, data| async move {
            match single_arg(&data, "task_id") {
                Some(task_id) => {
                    socket.join(task_room(&task_id));
                }
                None => bad_args(&socket, "task_subscribe", &data),
            }
        });

        socket.on("task_unsubscribe", |socket, data| async move {
            match single_arg(&data, "task_id") {
                Some(task_id) => {
                    socket.leave(&task_room(&task_id));
                }
                None => bad_args(&socket, "task_unsubscribe", &data),
            }
        });

        let permissions = self.permissions.clone();
        socket.on("doc_subscribe", move |socket, data| {
            let permissions = permissions.clone();
            async move {
                let Some((doctype, docname)) = doc_args(&data) else {
                    return bad_args(&socket, "doc_subscribe", &data);
                };
                if permissions
                    .can_subscribe_doc(&socket.auth().credentials, &doctype, &docname)
                    .await
                {
                    socket.join(doc_room(&doctype, &docname));
                } else {
                    denied(&socket, "doc_subscribe", &format!("{doctype}/{docname}"));
                }
            }
        });

        socket.on("doc_unsubscribe", |socket, data| async move {
            match doc_args(&data) {
                Some((doctype, docname)) => {
                    socket.leave(&doc_room(&doctype, &docname));
                }
                None => bad_args(&socket, "doc_unsubscribe", &data),
            }
        });

        let permissions = self.permissions.clone();
        socket.on("doc_open", move |socket, data| {
            let permissions = permissions.clone();
            async move {
                let Some((doctype, docname)) = doc_args(&data) else {
                    return bad_args(&socket, "doc_open", &data);
                };
                if permissions
                    .can_subscribe_doc(&socket.auth().credentials, &doctype, &docname)
                    .await
                {
                    socket.join(open_doc_room(&doctype, &docname));
                    notify_viewers(&socket, &doctype, &docname);
                } else {
                    denied(&socket, "doc_open", &format!("{doctype}/{docname}"));
                }
            }
        });

        socket.on("doc_close", |socket, data| async move {
            match doc_args(&data) {
                Some((doctype, docname)) => {
                    socket.leave(&open_doc_room(&doctype, &docname));
                    notify_viewers(&socket, &doctype, &docname);
                }
                None => bad_args(&socket, "doc_close", &data),
            }
        });

        // Tabs closed without doc_close
        socket.on(DISCONNECT_EVENT, |socket, _| async move {
            for room in socket.rooms() {
                let Some((doctype, docname)) = parse_open_doc_room(&room) else {
                    continue;
                };
                socket.leave(&room);
                notify_viewers(&socket, doctype, docname);
            }
        });

        Ok(())
    }
}

/// Tell everyone viewing a document who else has it open
fn notify_viewers(socket: &Socket, doctype: &str, docname: &str) {
    let room = open_doc_room(doctype, docname);
    let users = socket.room_users(&room);
    socket.emit_to_room(
        &room,
        "doc_viewers",
        json!({
            "doctype": doctype,
            "docname": docname,
            "users": users,
        }),
    );
}

fn bad_args(socket: &Socket, event: &str, data: &Value) {
    warn!(
        namespace = %socket.namespace(),
        connection_id = %socket.id(),
        event = event,
        data = %data,
        "Ignoring event with invalid arguments"
    );
}

fn denied(socket: &Socket, event: &str, target: &str) {
    debug!(
        namespace = %socket.namespace(),
        connection_id = %socket.id(),
        user = %socket.user(),
        event = event,
        target = target,
        "Subscription not permitted"
    );
}

fn as_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// One argument given as `"x"`, `["x"]` or `{"<key>": "x"}`
fn single_arg(data: &Value, key: &str) -> Option<String> {
    match data {
        Value::Array(items) => items.first().and_then(as_name),
        Value::Object(map) => map.get(key).and_then(as_name),
        other => as_name(other),
    }
}

/// `[doctype, docname]` or `{"doctype": .., "docname": ..}`
fn doc_args(data: &Value) -> Option<(String, String)> {
    match data {
        Value::Array(items) => Some((as_name(items.first()?)?, as_name(items.get(1)?)?)),
        Value::Object(map) => Some((as_name(map.get("doctype")?)?, as_name(map.get("docname")?)?)),
        _ => None,
    }
}
