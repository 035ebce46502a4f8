//! Two-pointer reconciliation of indexed UIDs against live files.
//!
//! Both sides arrive in ascending UID order. For each live file, indexed
//! UIDs sorting before it are stale and removed; an exact match means the
//! file is unchanged; anything else is added. Whatever the cursor still
//! holds after the walk belongs to files that are gone.

use serde::Serialize;

use super::store::TermCursor;
use super::uid;

/// Forward cursor over sorted UIDs.
pub trait UidCursor {
    fn peek(&self) -> Option<&str>;
    fn advance(&mut self);
}

impl UidCursor for TermCursor {
    fn peek(&self) -> Option<&str> {
        TermCursor::peek(self)
    }

    fn advance(&mut self) {
        TermCursor::advance(self)
    }
}

/// Receives the classification of every UID.
pub trait MergeSink<T> {
    /// Polled before each live file; `true` stops the merge without draining.
    fn interrupted(&self) -> bool {
        false
    }

    /// `superseded` is true when the live file being visited has the same
    /// path, i.e. the document is about to be replaced rather than deleted.
    fn remove(&mut self, uid: &str, superseded: bool);

    fn unchanged(&mut self, uid: &str, item: T);

    /// `modified` is true when a superseded document preceded this add.
    fn add(&mut self, uid: String, item: T, modified: bool);
}

/// Run the merge. Returns `false` when the sink interrupted it.
pub fn sorted_merge<C, I, T, S>(cursor: &mut C, live: I, sink: &mut S) -> bool
where
    C: UidCursor,
    I: IntoIterator<Item = (String, T)>,
    S: MergeSink<T>,
{
    for (live_uid, item) in live {
        if sink.interrupted() {
            return false;
        }
        let path = uid::path_of(&live_uid);
        let mut superseded = false;
        while let Some(term) = cursor.peek() {
            if term >= live_uid.as_str() {
                break;
            }
            let same_path = uid::path_of(term) == path;
            superseded |= same_path;
            sink.remove(term, same_path);
            cursor.advance();
        }
        if cursor.peek() == Some(live_uid.as_str()) {
            cursor.advance();
            sink.unchanged(&live_uid, item);
        } else {
            sink.add(live_uid, item, superseded);
        }
    }

    // drain
    while let Some(term) = cursor.peek() {
        sink.remove(term, false);
        cursor.advance();
    }
    true
}

// ─── Collected classification ───────────────────────────────────────

/// Outcome of [`reconcile`], one list per class.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub unchanged: Vec<String>,
    pub added: Vec<String>,
    pub modified: Vec<String>,
    /// Indexed UIDs without a live counterpart, superseded ones included.
    pub removed: Vec<String>,
}

/// Cursor over a sorted slice.
pub struct SliceCursor<'a> {
    uids: &'a [String],
    pos: usize,
}

impl<'a> SliceCursor<'a> {
    pub fn new(uids: &'a [String]) -> Self {
        Self { uids, pos: 0 }
    }
}

impl UidCursor for SliceCursor<'_> {
    fn peek(&self) -> Option<&str> {
        self.uids.get(self.pos).map(String::as_str)
    }

    fn advance(&mut self) {
        self.pos += 1;
    }
}

impl MergeSink<()> for Reconciliation {
    fn remove(&mut self, uid: &str, _superseded: bool) {
        self.removed.push(uid.to_string());
    }

    fn unchanged(&mut self, uid: &str, _item: ()) {
        self.unchanged.push(uid.to_string());
    }

    fn add(&mut self, uid: String, _item: (), modified: bool) {
        if modified {
            self.modified.push(uid);
        } else {
            self.added.push(uid);
        }
    }
}

/// Classify sorted `live` UIDs against sorted `existing` UIDs.
pub fn reconcile(existing: &[String], live: &[String]) -> Reconciliation {
    let mut result = Reconciliation::default();
    let mut cursor = SliceCursor::new(existing);
    sorted_merge(&mut cursor, live.iter().map(|u| (u.clone(), ())), &mut result);
    result
}
