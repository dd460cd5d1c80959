use serde::{Deserialize, Serialize};

use crate::errors::{AppError, Result};
use crate::utils::to_safe_path;

pub const DEFAULT_EXTENSION: &str = "mp3";

/// Per-job settings supplied by the popup alongside the item batch.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobSettings {
    #[serde(default)]
    pub download_subdir: String,
    #[serde(default)]
    pub post_download_action: PostDownloadAction,
    #[serde(default)]
    pub move_target_tag: String,
    #[serde(default)]
    pub include_metadata: bool,
}

impl JobSettings {
    /// Checked before any network activity: a move action is meaningless
    /// without a destination tag.
    pub fn validate(&self) -> Result<()> {
        if self.post_download_action == PostDownloadAction::Move
            && self.move_target_tag.trim().is_empty()
        {
            return Err(AppError::InvalidInput(
                "Set a destination folder ID before moving recordings.".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sanitized_subdir(&self) -> String {
        to_safe_path(&self.download_subdir)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PostDownloadAction {
    #[default]
    None,
    Move,
    Trash,
}

impl PostDownloadAction {
    /// Parses the wire value, surfacing unknown actions with a readable
    /// message instead of a serde error.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(Self::None),
            "move" => Ok(Self::Move),
            "trash" => Ok(Self::Trash),
            other => Err(AppError::InvalidInput(format!(
                "Unsupported post-download action: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictAction {
    #[default]
    Uniquify,
    Overwrite,
}

impl ConflictAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictAction::Uniquify => "uniquify",
            ConflictAction::Overwrite => "overwrite",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_action_requires_target_tag() {
        let settings = JobSettings {
            post_download_action: PostDownloadAction::Move,
            ..JobSettings::default()
        };
        assert!(settings.validate().is_err());

        let settings = JobSettings {
            post_download_action: PostDownloadAction::Move,
            move_target_tag: "tag-42".to_string(),
            ..JobSettings::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn subdir_is_sanitized_on_read() {
        let settings = JobSettings {
            download_subdir: "///Plaud**//Recordings??".to_string(),
            ..JobSettings::default()
        };
        assert_eq!(settings.sanitized_subdir(), "Plaud/Recordings");
    }

    #[test]
    fn settings_deserialize_from_popup_payload() {
        let settings: JobSettings = serde_json::from_value(serde_json::json!({
            "downloadSubdir": "plaud",
            "postDownloadAction": "move",
            "moveTargetTag": "tag-7",
            "includeMetadata": true
        }))
        .unwrap();

        assert_eq!(settings.post_download_action, PostDownloadAction::Move);
        assert!(settings.include_metadata);
    }

    #[test]
    fn unknown_action_is_rejected_with_message() {
        let error = PostDownloadAction::parse("archive").unwrap_err();
        assert!(error.to_string().contains("Unsupported post-download action"));
    }
}
