//! External notebook blob store client and local backup fallback.
//!
//! The blob store speaks HTTP CRUD over whole-notebook JSON payloads; the
//! local backup mirrors the same payload to a file so a session can reopen
//! its last state with no network at all. Payloads from either source may
//! carry duplicate cell ids — the session sanitizes after seeding, never
//! before handing the document to the UI.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::{CellType, NotebookDoc, ORIGIN_REMOTE};
use crate::document::{DEFAULT_CODE_PREFIX, DEFAULT_MARKDOWN_PREFIX, DEFAULT_TITLE};
use crate::kernel::{CellOutput, Variable};

/// One cell as stored externally. Runtime fields ride along so an export
/// keeps its outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCell {
    pub id: String,
    #[serde(rename = "type")]
    pub cell_type: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<CellOutput>,
    #[serde(
        rename = "executionCount",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub execution_count: Option<u32>,
}

/// Whole-notebook payload for PUT/GET.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredNotebook {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub cells: Vec<StoredCell>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,
}

impl StoredNotebook {
    /// Whether this payload is just the seeded default template; such a
    /// payload never wins over live state during promotion.
    pub fn is_default_template(&self) -> bool {
        self.title == DEFAULT_TITLE
            && self.cells.len() == 2
            && self.cells[0].cell_type == "markdown"
            && self.cells[0].content.starts_with(DEFAULT_MARKDOWN_PREFIX)
            && self.cells[1].cell_type == "code"
            && self.cells[1].content.starts_with(DEFAULT_CODE_PREFIX)
    }

    /// Seed a document from this payload in one transaction, replacing any
    /// cells already present (the promotion path re-seeds over a freshly
    /// defaulted document). Duplicate ids and stray types survive here; the
    /// caller sanitizes afterwards.
    pub fn apply_to_doc(&self, doc: &NotebookDoc) {
        let mut txn = doc.transact_with(ORIGIN_REMOTE);
        doc.set_title_in(&mut txn, &self.title);
        doc.clear_cells_in(&mut txn);
        for (i, cell) in self.cells.iter().enumerate() {
            doc.insert_cell_raw(
                &mut txn,
                i as u32,
                &cell.id,
                CellType::coerce(&cell.cell_type),
                &cell.content,
            );
        }
    }
}

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("blob store unreachable: {0}")]
    Transport(String),
    #[error("notebook not found")]
    NotFound,
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("backup io error: {0}")]
    Io(String),
}

impl From<reqwest::Error> for BlobStoreError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct NotebookEnvelope {
    notebook: StoredNotebook,
}

#[derive(Debug, Deserialize)]
struct NotebookListEnvelope {
    #[serde(default)]
    notebooks: Vec<NotebookListing>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotebookListing {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

/// HTTP client for the external notebook store.
pub struct BlobStoreClient {
    http: reqwest::Client,
    base_url: String,
}

impl BlobStoreClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BlobStoreError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub async fn list(&self) -> Result<Vec<NotebookListing>, BlobStoreError> {
        let response = self
            .http
            .get(format!("{}/notebooks", self.base_url))
            .send()
            .await?;
        let body: NotebookListEnvelope = response
            .json()
            .await
            .map_err(|e| BlobStoreError::Malformed(e.to_string()))?;
        Ok(body.notebooks)
    }

    pub async fn load(&self, notebook_id: &str) -> Result<StoredNotebook, BlobStoreError> {
        let response = self
            .http
            .get(format!("{}/notebooks/{notebook_id}", self.base_url))
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Err(BlobStoreError::NotFound);
        }
        if !response.status().is_success() {
            return Err(BlobStoreError::Transport(format!(
                "load returned {}",
                response.status()
            )));
        }
        let body: NotebookEnvelope = response
            .json()
            .await
            .map_err(|e| BlobStoreError::Malformed(e.to_string()))?;
        Ok(body.notebook)
    }

    pub async fn save(
        &self,
        notebook_id: &str,
        notebook: &StoredNotebook,
    ) -> Result<(), BlobStoreError> {
        let response = self
            .http
            .put(format!("{}/notebooks/{notebook_id}", self.base_url))
            .json(notebook)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BlobStoreError::Transport(format!(
                "save returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    pub async fn delete(&self, notebook_id: &str) -> Result<(), BlobStoreError> {
        let response = self
            .http
            .delete(format!("{}/notebooks/{notebook_id}", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(BlobStoreError::Transport(format!(
                "delete returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// File-based backup every client writes on each auto-save tick, leader or
/// not.
pub struct LocalBackup {
    dir: PathBuf,
}

impl LocalBackup {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, notebook_id: &str) -> PathBuf {
        self.dir.join(format!("{notebook_id}.json"))
    }

    pub fn save(
        &self,
        notebook_id: &str,
        notebook: &StoredNotebook,
    ) -> Result<(), BlobStoreError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| BlobStoreError::Io(e.to_string()))?;
        let json =
            serde_json::to_vec_pretty(notebook).map_err(|e| BlobStoreError::Io(e.to_string()))?;
        std::fs::write(self.path(notebook_id), json).map_err(|e| BlobStoreError::Io(e.to_string()))
    }

    pub fn load(&self, notebook_id: &str) -> Result<StoredNotebook, BlobStoreError> {
        let bytes = std::fs::read(self.path(notebook_id)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BlobStoreError::NotFound
            } else {
                BlobStoreError::Io(e.to_string())
            }
        })?;
        serde_json::from_slice(&bytes).map_err(|e| BlobStoreError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stored_notebook_deserializes_wire_shape() {
        let nb: StoredNotebook = serde_json::from_value(json!({
            "id": "nb1",
            "title": "My Notebook",
            "cells": [
                {"id": "a", "type": "markdown", "content": "# hi"},
                {"id": "b", "type": "code", "content": "1+1",
                 "output": {"type": "text", "content": "2"},
                 "executionCount": 3},
            ]
        }))
        .unwrap();
        assert_eq!(nb.cells.len(), 2);
        assert_eq!(nb.cells[1].execution_count, Some(3));
        assert_eq!(nb.cells[1].output.as_ref().unwrap().content, "2");
    }

    #[test]
    fn test_default_template_fingerprint() {
        let default = StoredNotebook {
            id: None,
            title: DEFAULT_TITLE.to_string(),
            cells: vec![
                StoredCell {
                    id: "a".into(),
                    cell_type: "markdown".into(),
                    content: format!("{DEFAULT_MARKDOWN_PREFIX}\n\nmore"),
                    output: None,
                    execution_count: None,
                },
                StoredCell {
                    id: "b".into(),
                    cell_type: "code".into(),
                    content: DEFAULT_CODE_PREFIX.to_string(),
                    output: None,
                    execution_count: None,
                },
            ],
            variables: Vec::new(),
        };
        assert!(default.is_default_template());

        let mut edited = default.clone();
        edited.title = "Real work".into();
        assert!(!edited.is_default_template());
    }

    #[test]
    fn test_apply_to_doc_keeps_duplicate_ids_for_sanitize() {
        let nb: StoredNotebook = serde_json::from_value(json!({
            "title": "Dup",
            "cells": [
                {"id": "dup", "type": "code", "content": "a"},
                {"id": "dup", "type": "code", "content": "b"},
            ]
        }))
        .unwrap();

        let doc = NotebookDoc::new();
        nb.apply_to_doc(&doc);
        let cells = doc.cells_snapshot();
        assert_eq!(cells[0].id, "dup");
        assert_eq!(cells[1].id, "dup");

        assert!(doc.sanitize());
        let cells = doc.cells_snapshot();
        assert_ne!(cells[0].id, cells[1].id);
        assert_eq!(cells[0].id, "dup");
    }

    #[test]
    fn test_local_backup_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backup = LocalBackup::new(dir.path());

        assert!(matches!(backup.load("nb"), Err(BlobStoreError::NotFound)));

        let nb = StoredNotebook {
            id: Some("nb".into()),
            title: "Backed up".into(),
            cells: vec![StoredCell {
                id: "c".into(),
                cell_type: "code".into(),
                content: "x = 1".into(),
                output: None,
                execution_count: None,
            }],
            variables: Vec::new(),
        };
        backup.save("nb", &nb).unwrap();

        let loaded = backup.load("nb").unwrap();
        assert_eq!(loaded.title, "Backed up");
        assert_eq!(loaded.cells[0].content, "x = 1");
    }
}
