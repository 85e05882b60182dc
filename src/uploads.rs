//! Blob Store: accept an image upload, return a reference. Files land in
//! the uploads directory and are served statically from `/uploads`.

use std::ffi::OsStr;
use std::path::Path;

use axum::extract::{Multipart, State};
use axum::Json;
use serde_json::json;
use time::OffsetDateTime;

use crate::error::{RelayError, RelayResult};
use crate::Config;

#[axum::debug_handler(state = crate::AppState)]
pub async fn upload(
    State(config): State<Config>,
    mut multipart: Multipart,
) -> RelayResult<Json<serde_json::Value>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| RelayError::InvalidInput(err.to_string()))?
    {
        if field.name() != Some("image") {
            continue;
        }

        let extension = field
            .file_name()
            .and_then(|name| Path::new(name).extension().and_then(OsStr::to_str))
            .unwrap_or("bin")
            .to_owned();

        let bytes = field
            .bytes()
            .await
            .map_err(|err| RelayError::InvalidInput(err.to_string()))?;

        let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let filename = format!("{stamp}.{extension}");

        tokio::fs::create_dir_all(&config.upload_dir)
            .await
            .map_err(anyhow::Error::from)?;
        tokio::fs::write(config.upload_dir.join(&filename), &bytes)
            .await
            .map_err(anyhow::Error::from)?;

        return Ok(Json(json!({ "filename": filename })));
    }

    Err(RelayError::InvalidInput("no image field in upload".into()))
}
