//! Notebook document model on top of a yrs CRDT document.
//!
//! The replicated document has exactly two roots: `title` (collaborative
//! text) and `cells` (ordered array of cell maps). Each cell map carries
//! `id` (stable unique string), `type` (`code` | `markdown`) and `content`
//! (collaborative text).
//!
//! [`NotebookDoc::sanitize`] enforces those invariants after hydration and
//! before every socket joins: colliding or missing ids are re-minted, stray
//! types coerce to `code`, scalar content is promoted to collaborative text.
//! Sanitization runs in a single transaction so observers see one update.

use std::collections::HashSet;

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, Doc, GetString, Map, MapPrelim, MapRef, Origin, Out, ReadTxn,
    StateVector, Subscription, Text, TextPrelim, TextRef, Transact, TransactionMut, Update,
};

use crate::awareness::ClientId;

/// Root field names.
const TITLE_ROOT: &str = "title";
const CELLS_ROOT: &str = "cells";

/// Cell map keys.
const KEY_ID: &str = "id";
const KEY_TYPE: &str = "type";
const KEY_CONTENT: &str = "content";

/// Seeded defaults for a brand-new notebook.
pub const DEFAULT_TITLE: &str = "Untitled Notebook";
pub const DEFAULT_MARKDOWN_PREFIX: &str = "# New Notebook";
pub const DEFAULT_CODE_PREFIX: &str = "# Write Python code here";

const DEFAULT_MARKDOWN_CELL: &str =
    "# New Notebook\n\nWelcome! Edit this cell, or add more below. Everyone \
     viewing this notebook sees your changes live.";
const DEFAULT_CODE_CELL: &str = "# Write Python code here\nprint(\"hello\")";

/// Transaction origins used to tell update sources apart in the update hook.
pub const ORIGIN_LOCAL: &str = "local";
pub const ORIGIN_REMOTE: &str = "remote";
pub const ORIGIN_SANITIZE: &str = "sanitize";

/// Document errors.
#[derive(Debug, Clone)]
pub enum DocError {
    /// A snapshot or update failed to decode or apply.
    Encoding(String),
    /// Deleting would leave the notebook without any cell.
    LastCell,
    /// No cell with the given id.
    CellNotFound(String),
    /// Installing the update hook failed.
    Observe(String),
}

impl std::fmt::Display for DocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encoding(e) => write!(f, "encoding error: {e}"),
            Self::LastCell => write!(f, "a notebook keeps at least one cell"),
            Self::CellNotFound(id) => write!(f, "no cell with id {id}"),
            Self::Observe(e) => write!(f, "observer error: {e}"),
        }
    }
}

impl std::error::Error for DocError {}

/// Discriminant for the two cell kinds. Anything else on the wire coerces
/// to `Code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    Code,
    Markdown,
}

impl CellType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Markdown => "markdown",
        }
    }

    /// Strict parse; `None` for anything outside the enum.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "code" => Some(Self::Code),
            "markdown" => Some(Self::Markdown),
            _ => None,
        }
    }

    /// Lenient parse used during sanitization.
    pub fn coerce(s: &str) -> Self {
        Self::parse(s).unwrap_or(Self::Code)
    }
}

/// Point-in-time view of one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellData {
    pub id: String,
    pub cell_type: CellType,
    pub content: String,
}

/// Mint a fresh cell id.
pub fn mint_cell_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn any_to_string(any: &Any) -> String {
    match any {
        Any::String(s) => s.to_string(),
        Any::Bool(b) => b.to_string(),
        Any::Number(n) => n.to_string(),
        Any::BigInt(n) => n.to_string(),
        _ => String::new(),
    }
}

/// The notebook CRDT document.
pub struct NotebookDoc {
    doc: Doc,
    title: TextRef,
    cells: ArrayRef,
}

impl NotebookDoc {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Deterministic client id; used by tests and by sessions that need a
    /// stable identity across a reconnect.
    pub fn with_client_id(client_id: ClientId) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    fn from_doc(doc: Doc) -> Self {
        let title = doc.get_or_insert_text(TITLE_ROOT);
        let cells = doc.get_or_insert_array(CELLS_ROOT);
        Self { doc, title, cells }
    }

    pub fn client_id(&self) -> ClientId {
        self.doc.client_id()
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Install the update hook. Every committed transaction forwards its
    /// origin and v1 update bytes through `tx`, in applied order.
    pub fn observe_updates(
        &self,
        tx: UnboundedSender<(Option<Origin>, Vec<u8>)>,
    ) -> Result<Subscription, DocError> {
        self.doc
            .observe_update_v1(move |txn: &TransactionMut, event| {
                let _ = tx.send((txn.origin().cloned(), event.update.clone()));
            })
            .map_err(|e| DocError::Observe(e.to_string()))
    }

    // ─── snapshots ──────────────────────────────────────────────────

    /// Full document state as a yrs v1 update.
    pub fn encode_snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Apply a snapshot/update under the given origin tag.
    pub fn apply_update(&self, bytes: &[u8], origin: &str) -> Result<(), DocError> {
        let update = Update::decode_v1(bytes).map_err(|e| DocError::Encoding(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(origin);
        txn.apply_update(update)
            .map_err(|e| DocError::Encoding(e.to_string()))
    }

    // ─── reads ──────────────────────────────────────────────────────

    pub fn title_string(&self) -> String {
        let txn = self.doc.transact();
        self.title.get_string(&txn)
    }

    pub fn cell_count(&self) -> u32 {
        let txn = self.doc.transact();
        self.cells.len(&txn)
    }

    /// Cells in document order. Pre-sanitize shapes degrade gracefully:
    /// missing fields read as empty/`code`.
    pub fn cells_snapshot(&self) -> Vec<CellData> {
        let txn = self.doc.transact();
        let mut out = Vec::with_capacity(self.cells.len(&txn) as usize);
        for i in 0..self.cells.len(&txn) {
            let Some(Out::YMap(cell)) = self.cells.get(&txn, i) else {
                continue;
            };
            out.push(CellData {
                id: read_string_field(&txn, &cell, KEY_ID),
                cell_type: CellType::coerce(&read_string_field(&txn, &cell, KEY_TYPE)),
                content: read_content(&txn, &cell),
            });
        }
        out
    }

    pub fn find_cell_index(&self, id: &str) -> Option<u32> {
        let txn = self.doc.transact();
        for i in 0..self.cells.len(&txn) {
            if let Some(Out::YMap(cell)) = self.cells.get(&txn, i) {
                if read_string_field(&txn, &cell, KEY_ID) == id {
                    return Some(i);
                }
            }
        }
        None
    }

    /// Whether the document still matches the seeded default template
    /// (title and both cell prefixes). Used by the promotion path that
    /// prefers an existing stored notebook over the freshly seeded one.
    pub fn is_default_template(&self) -> bool {
        if self.title_string() != DEFAULT_TITLE {
            return false;
        }
        let cells = self.cells_snapshot();
        cells.len() == 2
            && cells[0].cell_type == CellType::Markdown
            && cells[0].content.starts_with(DEFAULT_MARKDOWN_PREFIX)
            && cells[1].cell_type == CellType::Code
            && cells[1].content.starts_with(DEFAULT_CODE_PREFIX)
    }

    // ─── mutations ──────────────────────────────────────────────────

    /// Seed the two-cell default notebook.
    pub fn seed_default(&self, origin: &str) {
        let mut txn = self.doc.transact_mut_with(origin);
        if self.title.len(&txn) == 0 {
            self.title.insert(&mut txn, 0, DEFAULT_TITLE);
        }
        insert_cell_map(
            &self.cells,
            &mut txn,
            0,
            &mint_cell_id(),
            CellType::Markdown,
            DEFAULT_MARKDOWN_CELL,
        );
        insert_cell_map(
            &self.cells,
            &mut txn,
            1,
            &mint_cell_id(),
            CellType::Code,
            DEFAULT_CODE_CELL,
        );
    }

    /// Insert a fresh empty cell after `after_id` (or at the end) and
    /// return its minted id.
    pub fn insert_cell(
        &self,
        origin: &str,
        after_id: Option<&str>,
        cell_type: CellType,
    ) -> String {
        let index = match after_id.and_then(|id| self.find_cell_index(id)) {
            Some(i) => i + 1,
            None => self.cell_count(),
        };
        let id = mint_cell_id();
        let mut txn = self.doc.transact_mut_with(origin);
        insert_cell_map(&self.cells, &mut txn, index, &id, cell_type, "");
        id
    }

    /// Insert a fully specified cell at `index`; used when seeding from a
    /// stored notebook payload.
    pub fn insert_cell_raw(
        &self,
        txn: &mut TransactionMut,
        index: u32,
        id: &str,
        cell_type: CellType,
        content: &str,
    ) {
        insert_cell_map(&self.cells, txn, index, id, cell_type, content);
    }

    /// Open a mutable transaction tagged with `origin`; for multi-step
    /// seeding that must land as one update.
    pub fn transact_with(&self, origin: &str) -> TransactionMut {
        self.doc.transact_mut_with(origin)
    }

    /// Delete a cell; refuses to empty the notebook.
    pub fn delete_cell(&self, origin: &str, id: &str) -> Result<(), DocError> {
        if self.cell_count() <= 1 {
            return Err(DocError::LastCell);
        }
        let index = self
            .find_cell_index(id)
            .ok_or_else(|| DocError::CellNotFound(id.to_string()))?;
        let mut txn = self.doc.transact_mut_with(origin);
        self.cells.remove(&mut txn, index);
        Ok(())
    }

    /// Move a cell to `new_index` by delete + reinsert.
    pub fn move_cell(&self, origin: &str, id: &str, new_index: u32) -> Result<(), DocError> {
        let index = self
            .find_cell_index(id)
            .ok_or_else(|| DocError::CellNotFound(id.to_string()))?;
        let cells = self.cells_snapshot();
        let cell = cells[index as usize].clone();
        let new_index = new_index.min(cells.len() as u32 - 1);
        if new_index == index {
            return Ok(());
        }
        let mut txn = self.doc.transact_mut_with(origin);
        self.cells.remove(&mut txn, index);
        insert_cell_map(
            &self.cells,
            &mut txn,
            new_index,
            &cell.id,
            cell.cell_type,
            &cell.content,
        );
        Ok(())
    }

    pub fn set_cell_type(&self, origin: &str, id: &str, cell_type: CellType) -> Result<(), DocError> {
        let index = self
            .find_cell_index(id)
            .ok_or_else(|| DocError::CellNotFound(id.to_string()))?;
        let mut txn = self.doc.transact_mut_with(origin);
        if let Some(Out::YMap(cell)) = self.cells.get(&txn, index) {
            cell.insert(&mut txn, KEY_TYPE, cell_type.as_str());
        }
        Ok(())
    }

    /// Replace a cell's content with `next`, applying only the minimal
    /// prefix/suffix diff so concurrent edits on untouched regions survive.
    pub fn set_cell_content(&self, origin: &str, id: &str, next: &str) -> Result<(), DocError> {
        let index = self
            .find_cell_index(id)
            .ok_or_else(|| DocError::CellNotFound(id.to_string()))?;
        let mut txn = self.doc.transact_mut_with(origin);
        if let Some(Out::YMap(cell)) = self.cells.get(&txn, index) {
            match cell.get(&txn, KEY_CONTENT) {
                Some(Out::YText(text)) => splice_text(&text, &mut txn, next),
                _ => {
                    cell.insert(&mut txn, KEY_CONTENT, TextPrelim::new(next));
                }
            }
        }
        Ok(())
    }

    /// Same diff strategy on the title.
    pub fn set_title(&self, origin: &str, next: &str) {
        let mut txn = self.doc.transact_mut_with(origin);
        splice_text(&self.title, &mut txn, next);
    }

    /// Title splice inside an existing transaction; for bulk seeding.
    pub fn set_title_in(&self, txn: &mut TransactionMut, next: &str) {
        splice_text(&self.title, txn, next);
    }

    /// Drop every cell; for re-seeding from a stored payload.
    pub fn clear_cells_in(&self, txn: &mut TransactionMut) {
        let len = self.cells.len(txn);
        if len > 0 {
            self.cells.remove_range(txn, 0, len);
        }
    }

    // ─── sanitization ───────────────────────────────────────────────

    /// Enforce the document invariants; returns whether anything changed.
    /// Idempotent, and all repairs land in one transaction.
    pub fn sanitize(&self) -> bool {
        enum Repair {
            SetId(u32, String),
            SetType(u32),
            PromoteContent(u32, String),
            ReplaceElement(u32, String),
        }

        let mut repairs: Vec<Repair> = Vec::new();
        {
            let txn = self.doc.transact();
            let mut seen: HashSet<String> = HashSet::new();
            for i in 0..self.cells.len(&txn) {
                match self.cells.get(&txn, i) {
                    Some(Out::YMap(cell)) => {
                        let id = match cell.get(&txn, KEY_ID) {
                            Some(Out::Any(Any::String(s))) if !s.is_empty() => s.to_string(),
                            _ => String::new(),
                        };
                        if id.is_empty() || !seen.insert(id.clone()) {
                            let fresh = mint_cell_id();
                            seen.insert(fresh.clone());
                            repairs.push(Repair::SetId(i, fresh));
                        }

                        let type_ok = matches!(
                            cell.get(&txn, KEY_TYPE),
                            Some(Out::Any(Any::String(ref s))) if CellType::parse(s).is_some()
                        );
                        if !type_ok {
                            repairs.push(Repair::SetType(i));
                        }

                        match cell.get(&txn, KEY_CONTENT) {
                            Some(Out::YText(_)) => {}
                            Some(Out::Any(any)) => {
                                repairs.push(Repair::PromoteContent(i, any_to_string(&any)));
                            }
                            _ => repairs.push(Repair::PromoteContent(i, String::new())),
                        }
                    }
                    Some(Out::Any(any)) => {
                        repairs.push(Repair::ReplaceElement(i, any_to_string(&any)));
                    }
                    Some(_) | None => repairs.push(Repair::ReplaceElement(i, String::new())),
                }
            }
        }

        if repairs.is_empty() {
            return false;
        }

        log::warn!("document sanitize: applying {} repair(s)", repairs.len());
        let mut txn = self.doc.transact_mut_with(ORIGIN_SANITIZE);
        for repair in repairs {
            match repair {
                Repair::SetId(i, fresh) => {
                    if let Some(Out::YMap(cell)) = self.cells.get(&txn, i) {
                        cell.insert(&mut txn, KEY_ID, fresh.as_str());
                    }
                }
                Repair::SetType(i) => {
                    if let Some(Out::YMap(cell)) = self.cells.get(&txn, i) {
                        cell.insert(&mut txn, KEY_TYPE, CellType::Code.as_str());
                    }
                }
                Repair::PromoteContent(i, prior) => {
                    if let Some(Out::YMap(cell)) = self.cells.get(&txn, i) {
                        cell.insert(&mut txn, KEY_CONTENT, TextPrelim::new(prior));
                    }
                }
                Repair::ReplaceElement(i, prior) => {
                    self.cells.remove(&mut txn, i);
                    insert_cell_map(
                        &self.cells,
                        &mut txn,
                        i,
                        &mint_cell_id(),
                        CellType::Code,
                        &prior,
                    );
                }
            }
        }
        true
    }
}

impl Default for NotebookDoc {
    fn default() -> Self {
        Self::new()
    }
}

fn read_string_field<T: ReadTxn>(txn: &T, cell: &MapRef, key: &str) -> String {
    match cell.get(txn, key) {
        Some(Out::Any(Any::String(s))) => s.to_string(),
        _ => String::new(),
    }
}

fn read_content<T: ReadTxn>(txn: &T, cell: &MapRef) -> String {
    match cell.get(txn, KEY_CONTENT) {
        Some(Out::YText(text)) => text.get_string(txn),
        Some(Out::Any(any)) => any_to_string(&any),
        _ => String::new(),
    }
}

fn insert_cell_map(
    cells: &ArrayRef,
    txn: &mut TransactionMut,
    index: u32,
    id: &str,
    cell_type: CellType,
    content: &str,
) {
    let cell: MapRef = cells.insert(txn, index, MapPrelim::default());
    cell.insert(txn, KEY_ID, id);
    cell.insert(txn, KEY_TYPE, cell_type.as_str());
    cell.insert(txn, KEY_CONTENT, TextPrelim::new(content));
}

/// Apply `next` to `text` as a minimal (delete range, insert substring)
/// pair around the longest common prefix and suffix. Offsets are UTF-8
/// bytes snapped to character boundaries, matching the document's offset
/// kind.
pub fn splice_text(text: &TextRef, txn: &mut TransactionMut, next: &str) {
    let current = text.get_string(txn);
    if current == next {
        return;
    }

    let prefix = common_prefix_bytes(&current, next);
    let suffix = common_suffix_bytes(&current[prefix..], &next[prefix..]);

    let delete_len = current.len() - prefix - suffix;
    if delete_len > 0 {
        text.remove_range(txn, prefix as u32, delete_len as u32);
    }
    let insert = &next[prefix..next.len() - suffix];
    if !insert.is_empty() {
        text.insert(txn, prefix as u32, insert);
    }
}

fn common_prefix_bytes(a: &str, b: &str) -> usize {
    let mut prefix = 0;
    let mut iter_a = a.char_indices();
    let mut iter_b = b.chars();
    loop {
        match (iter_a.next(), iter_b.next()) {
            (Some((i, ca)), Some(cb)) if ca == cb => prefix = i + ca.len_utf8(),
            _ => break,
        }
    }
    prefix
}

fn common_suffix_bytes(a: &str, b: &str) -> usize {
    let mut suffix = 0;
    let mut iter_a = a.chars().rev();
    let mut iter_b = b.chars().rev();
    loop {
        match (iter_a.next(), iter_b.next()) {
            (Some(ca), Some(cb)) if ca == cb => suffix += ca.len_utf8(),
            _ => break,
        }
    }
    suffix
}
