// Editor buffer binding.
//
// Connects one host editor buffer to one shared file stream: local
// buffer edits become document updates, remote document changes become
// whole-buffer replacements with the caret restored. Two guards stop
// the echo loop where our own programmatic replacement comes back as a
// host change notification: a suppression flag held across the
// replacement, and a text comparison that catches notifications the
// host delivers late.

use huddle_common::doc::stream_name;

use crate::session::ClientSession;

/// The host editor's view of the open buffer. All offsets and lengths
/// are UTF-16 code units, the unit the document streams count in.
pub trait EditorBuffer {
    fn text(&self) -> String;
    /// Programmatic whole-buffer replacement.
    fn replace_text(&mut self, text: &str);
    /// Caret as a UTF-16 offset into the buffer.
    fn caret(&self) -> u32;
    fn set_caret(&mut self, offset: u32);
}

/// One change reported by the host editor, in UTF-16 code units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferChange {
    pub offset: u32,
    pub removed: u32,
    pub inserted: String,
}

pub type RemoteChangeCallback = Box<dyn FnMut(&str, &str)>;

pub struct EditorBinding {
    file_id: String,
    stream: String,
    suppressing: bool,
    on_remote_change: Option<RemoteChangeCallback>,
}

impl EditorBinding {
    /// Attach a buffer to the stream for `file_id`.
    ///
    /// If the stream is empty and the buffer has content, the buffer
    /// seeds the stream and the returned frames carry that edit. If the
    /// stream already has content, it wins and the buffer is replaced.
    pub fn bind(
        session: &mut ClientSession,
        buffer: &mut dyn EditorBuffer,
        file_id: &str,
    ) -> (Self, Vec<Vec<u8>>) {
        let mut binding = Self {
            file_id: file_id.to_string(),
            stream: stream_name(file_id),
            suppressing: false,
            on_remote_change: None,
        };

        let mut frames = Vec::new();
        let stream_text = session.doc().text(&binding.stream);
        let buffer_text = buffer.text();
        if stream_text.is_empty() && !buffer_text.is_empty() {
            frames.push(session.insert(file_id, 0, &buffer_text));
        } else if stream_text != buffer_text {
            binding.replace_buffer(buffer, &stream_text);
        }

        (binding, frames)
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    /// Register a callback invoked with `(file_id, new_text)` after a
    /// remote change lands in the buffer.
    pub fn on_remote_change<F>(&mut self, callback: F)
    where
        F: FnMut(&str, &str) + 'static,
    {
        self.on_remote_change = Some(Box::new(callback));
    }

    /// Translate host edits into update frames. Changes in one batch
    /// are applied from the highest offset down so earlier offsets stay
    /// valid while later ones are consumed.
    pub fn buffer_changed(
        &mut self,
        session: &mut ClientSession,
        buffer: &dyn EditorBuffer,
        changes: &[BufferChange],
    ) -> Vec<Vec<u8>> {
        if self.suppressing {
            return Vec::new();
        }
        // An echo of our own replacement: the buffer already matches
        // the stream, so there is nothing to forward.
        if buffer.text() == session.doc().text(&self.stream) {
            return Vec::new();
        }

        let mut ordered: Vec<&BufferChange> = changes.iter().collect();
        ordered.sort_by(|a, b| b.offset.cmp(&a.offset));
        ordered
            .into_iter()
            .map(|change| {
                session.splice(&self.file_id, change.offset, change.removed, &change.inserted)
            })
            .collect()
    }

    /// Bring the buffer up to date after a remote document change. The
    /// caret survives the replacement when it is still in bounds.
    pub fn sync_remote(&mut self, session: &ClientSession, buffer: &mut dyn EditorBuffer) {
        let stream_text = session.doc().text(&self.stream);
        if stream_text == buffer.text() {
            return;
        }

        let caret = buffer.caret();
        self.replace_buffer(buffer, &stream_text);
        let len = stream_text.encode_utf16().count() as u32;
        if caret <= len {
            buffer.set_caret(caret);
        }

        if let Some(callback) = self.on_remote_change.as_mut() {
            callback(&self.file_id, &stream_text);
        }
    }

    fn replace_buffer(&mut self, buffer: &mut dyn EditorBuffer, text: &str) {
        self.suppressing = true;
        buffer.replace_text(text);
        self.suppressing = false;
    }

    /// Detach. The buffer keeps its current content; the host is
    /// responsible for unhooking its change notifications.
    pub fn unbind(self) {}
}
