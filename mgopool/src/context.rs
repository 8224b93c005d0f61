// Copyright Rouven Bauer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};

use crate::error_::ErrorCode;

// imports for docs
#[allow(unused)]
use crate::pool::Pool;

/// Field under which [`Pool`] stamps the [`ErrorCode`] of a classified error.
pub const ERROR_CODE_FIELD: &str = "db.error_code";

/// Per-request context handed to the [`Pool`].
///
/// It bounds how long [`Pool::get()`] may block (deadline and cancellation) and collects
/// correlation fields for logging further up the stack.
///
/// ```
/// use std::time::Duration;
///
/// use mgopool::context::RequestContext;
///
/// let (ctx, cancel) = RequestContext::background()
///     .with_timeout(Duration::from_millis(50))
///     .with_cancel();
/// assert!(!ctx.is_cancelled());
/// cancel.cancel();
/// assert!(ctx.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancelled: Vec<Receiver<()>>,
    error_code: Option<ErrorCode>,
    fields: BTreeMap<String, String>,
}

/// Cancels the [`RequestContext`] it was created with.
///
/// **Note:** dropping the handle cancels the context as well.
/// Keep it alive for as long as the request should be allowed to wait.
#[derive(Debug)]
pub struct CancelHandle {
    _sender: Sender<()>,
}

impl CancelHandle {
    #[inline]
    pub fn cancel(self) {}
}

impl RequestContext {
    /// A context without deadline that cannot be cancelled.
    #[inline]
    pub fn background() -> Self {
        Self::default()
    }

    /// Limit the wait to `timeout` from now.
    ///
    /// If the context already has an earlier deadline, that one is kept.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    /// If the context already has an earlier deadline, that one is kept.
    pub fn with_deadline(self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self
        }
    }

    /// Make the context cancellable.
    ///
    /// Clones of the returned context share the cancellation.
    /// Deriving from a context that is already cancellable keeps the earlier signals: any of
    /// the handles cancels the derived context.
    pub fn with_cancel(mut self) -> (Self, CancelHandle) {
        let (sender, receiver) = flume::bounded(0);
        self.cancelled.push(receiver);
        (self, CancelHandle { _sender: sender })
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline; `None` if there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.iter().any(Receiver::is_disconnected)
    }

    pub(crate) fn cancellations(&self) -> &[Receiver<()>] {
        &self.cancelled
    }

    /// The code of the last error the pool classified for this context.
    #[inline]
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error_code
    }

    pub(crate) fn stamp_error_code(&mut self, code: ErrorCode) {
        self.error_code = Some(code);
        self.set_field(ERROR_CODE_FIELD, code.as_str());
    }

    pub fn set_field<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    fn test_background_never_expires() {
        let ctx = RequestContext::background();
        assert_eq!(ctx.deadline(), None);
        assert_eq!(ctx.remaining(), None);
        assert!(!ctx.is_cancelled());
    }

    #[rstest]
    fn test_earlier_deadline_wins() {
        let ctx = RequestContext::background()
            .with_timeout(Duration::from_millis(10))
            .with_timeout(Duration::from_secs(3600));
        assert!(ctx.remaining().unwrap() <= Duration::from_millis(10));
    }

    #[rstest]
    fn test_cancel_is_shared_with_clones() {
        let (ctx, cancel) = RequestContext::background().with_cancel();
        let clone = ctx.clone();
        drop(cancel);
        assert!(ctx.is_cancelled());
        assert!(clone.is_cancelled());
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_derived_cancel_keeps_parent_signal(#[case] cancel_parent: bool) {
        let (parent, parent_cancel) = RequestContext::background().with_cancel();
        let (child, child_cancel) = parent.clone().with_cancel();
        assert!(!child.is_cancelled());
        if cancel_parent {
            parent_cancel.cancel();
            assert!(parent.is_cancelled());
            assert!(child.is_cancelled());
            drop(child_cancel);
        } else {
            child_cancel.cancel();
            assert!(!parent.is_cancelled());
            assert!(child.is_cancelled());
            drop(parent_cancel);
        }
    }

    #[rstest]
    fn test_stamp_error_code() {
        let mut ctx = RequestContext::background();
        ctx.set_field("request_id", "abc");
        ctx.stamp_error_code(ErrorCode::DocumentConflict);
        assert_eq!(ctx.error_code(), Some(ErrorCode::DocumentConflict));
        assert_eq!(ctx.field(ERROR_CODE_FIELD), Some("DocumentConflict"));
        assert_eq!(ctx.field("request_id"), Some("abc"));
    }
}
