//! Client for the external room/participant persistence API.
//!
//! Only two calls matter to a voice client: finding a room that is waiting
//! for a listener, and persisting a participant's mute flag for display
//! outside the signaling path.

use beach_bonfire_core::{RoomId, Uid};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: StatusCode, body: String },
}

#[derive(Clone)]
pub struct RoomDirectory {
    http: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindRoomResponse {
    #[serde(default)]
    success: bool,
    room_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MuteRequest<'a> {
    room_id: &'a str,
    uid: Uid,
    is_muted: bool,
}

impl RoomDirectory {
    pub fn new(base_url: &Url) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
        }
    }

    /// Claims the oldest room still waiting for a listener. `None` when no
    /// room is waiting.
    pub async fn find_waiting_room(&self) -> Result<Option<RoomId>, DirectoryError> {
        let url = format!("{}/api/rooms/find", self.base_url);
        let res = self.http.get(url).send().await?;

        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !res.status().is_success() {
            return Err(unexpected(res).await);
        }
        let body = res.json::<FindRoomResponse>().await?;
        Ok(body
            .room_id
            .filter(|id| body.success && !id.is_empty())
            .map(RoomId::from))
    }

    pub async fn set_participant_muted(
        &self,
        room_id: &RoomId,
        uid: Uid,
        muted: bool,
    ) -> Result<(), DirectoryError> {
        let url = format!("{}/api/rooms/participant", self.base_url);
        let res = self
            .http
            .patch(url)
            .json(&MuteRequest {
                room_id: room_id.as_str(),
                uid,
                is_muted: muted,
            })
            .send()
            .await?;

        if res.status().is_success() {
            Ok(())
        } else {
            Err(unexpected(res).await)
        }
    }
}

async fn unexpected(res: reqwest::Response) -> DirectoryError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    DirectoryError::UnexpectedStatus { status, body }
}
