use crate::{
    codec::{DwpReader, DwpWriter},
    commands::{command_set, vm},
    connection::{Connection, PendingReplies},
    error::{status, DwpError, Result},
    types::{Feature, MethodId, ThreadId, Value},
};

pub mod invoke_flags {
    pub const DISABLE_BREAKPOINTS: i32 = 1;
    pub const SINGLE_THREADED: i32 = 2;
    pub const RETURN_OUT_THIS: i32 = 4;
    pub const RETURN_OUT_ARGS: i32 = 8;
    pub const VIRTUAL: i32 = 16;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InvokeOptions {
    pub disable_breakpoints: bool,
    pub single_threaded: bool,
    /// Return the receiver after the call (for valuetype receivers mutated in place).
    pub return_out_this: bool,
    /// Return by-ref / out argument values after the call.
    pub return_out_args: bool,
    pub virtual_call: bool,
}

impl InvokeOptions {
    pub fn bits(self) -> i32 {
        let mut bits = 0;
        for (set, flag) in [
            (self.disable_breakpoints, invoke_flags::DISABLE_BREAKPOINTS),
            (self.single_threaded, invoke_flags::SINGLE_THREADED),
            (self.return_out_this, invoke_flags::RETURN_OUT_THIS),
            (self.return_out_args, invoke_flags::RETURN_OUT_ARGS),
            (self.virtual_call, invoke_flags::VIRTUAL),
        ] {
            if set {
                bits |= flag;
            }
        }
        bits
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum InvokeOutcome {
    Returned(Value),
    /// The invoked method threw; the value is the exception object.
    Threw(Value),
}

#[derive(Clone, Debug, PartialEq)]
pub struct InvokeResult {
    pub outcome: InvokeOutcome,
    pub out_this: Option<Value>,
    pub out_args: Option<Vec<Value>>,
}

impl InvokeResult {
    pub fn returned(&self) -> Option<&Value> {
        match &self.outcome {
            InvokeOutcome::Returned(v) => Some(v),
            InvokeOutcome::Threw(_) => None,
        }
    }

    pub fn exception(&self) -> Option<&Value> {
        match &self.outcome {
            InvokeOutcome::Threw(v) => Some(v),
            InvokeOutcome::Returned(_) => None,
        }
    }
}

pub(crate) fn decode_invoke_reply(payload: &[u8], flags: i32) -> Result<InvokeResult> {
    let mut r = DwpReader::new(payload);
    let kind = r.read_u8()?;
    let value = r.read_value()?;
    let outcome = match kind {
        1 => InvokeOutcome::Returned(value),
        0 => InvokeOutcome::Threw(value),
        other => {
            return Err(DwpError::Protocol(format!(
                "invalid invoke result kind {other}"
            )))
        }
    };
    let out_this = if flags & invoke_flags::RETURN_OUT_THIS != 0 {
        Some(r.read_value()?)
    } else {
        None
    };
    let out_args = if flags & invoke_flags::RETURN_OUT_ARGS != 0 {
        Some(r.read_values()?)
    } else {
        None
    };
    Ok(InvokeResult {
        outcome,
        out_this,
        out_args,
    })
}

/// An in-flight `INVOKE_METHOD`.
pub struct PendingInvoke {
    conn: Connection,
    thread: ThreadId,
    flags: i32,
    replies: PendingReplies,
}

impl PendingInvoke {
    /// The id to pass to [`Connection::abort_invoke`].
    pub fn request_id(&self) -> u32 {
        self.replies.id()
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub async fn wait(mut self) -> Result<InvokeResult> {
        match self.replies.next().await {
            Some(Ok(payload)) => decode_invoke_reply(&payload, self.flags),
            Some(Err(err)) => Err(err),
            None => Err(DwpError::InvalidState("invoke reply already consumed")),
        }
    }

    pub async fn abort(&self) -> Result<()> {
        self.conn.abort_invoke(self.thread, self.request_id()).await
    }
}

/// An in-flight `INVOKE_METHODS`: one reply per method under a single id.
pub struct InvokeBatch {
    conn: Connection,
    thread: ThreadId,
    flags: i32,
    len: usize,
    replies: PendingReplies,
}

impl InvokeBatch {
    pub fn request_id(&self) -> u32 {
        self.replies.id()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Results still outstanding.
    pub fn remaining(&self) -> usize {
        self.replies.remaining()
    }

    /// The next individual result in arrival order, or `None` once the
    /// batch is complete.
    pub async fn next_item(&mut self) -> Option<Result<InvokeResult>> {
        let reply = self.replies.next().await?;
        Some(reply.and_then(|payload| decode_invoke_reply(&payload, self.flags)))
    }

    /// Wait for every outstanding result. Fails on the first failed item.
    pub async fn wait_all(mut self) -> Result<Vec<InvokeResult>> {
        let mut results = Vec::with_capacity(self.remaining());
        while let Some(item) = self.next_item().await {
            results.push(item?);
        }
        Ok(results)
    }

    pub async fn abort(&self) -> Result<()> {
        self.conn.abort_invoke(self.thread, self.request_id()).await
    }
}

impl Connection {
    /// Start a method invocation on a suspended thread.
    ///
    /// The returned handle resolves when the peer reports the result; it
    /// can be aborted meanwhile.
    pub async fn invoke_method(
        &self,
        thread: ThreadId,
        method: MethodId,
        this: &Value,
        args: &[Value],
        options: InvokeOptions,
    ) -> Result<PendingInvoke> {
        let flags = options.bits();
        let mut w = DwpWriter::new();
        w.write_id(thread);
        w.write_i32(flags);
        w.write_id(method);
        w.write_value(this);
        w.write_values(args);
        let replies = self
            .request_async(command_set::VM, vm::INVOKE_METHOD, w.into_vec(), 1)
            .await?;
        tracing::debug!(
            target: "nova.dwp",
            thread,
            method,
            id = replies.id(),
            "invoke started"
        );
        Ok(PendingInvoke {
            conn: self.clone(),
            thread,
            flags,
            replies,
        })
    }

    /// Invoke several methods on one receiver in a single packet.
    ///
    /// `args[i]` are the arguments for `methods[i]`.
    pub async fn invoke_methods(
        &self,
        thread: ThreadId,
        methods: &[MethodId],
        this: &Value,
        args: &[Vec<Value>],
        options: InvokeOptions,
    ) -> Result<InvokeBatch> {
        self.require(Feature::InvokeMethods)?;
        if methods.is_empty() {
            return Err(DwpError::InvalidState("invoke batch has no methods"));
        }
        if methods.len() != args.len() {
            return Err(DwpError::InvalidState("method and argument counts differ"));
        }

        let flags = options.bits();
        let mut w = DwpWriter::new();
        w.write_id(thread);
        w.write_i32(flags);
        w.write_i32(methods.len() as i32);
        for (method, method_args) in methods.iter().zip(args) {
            w.write_id(*method);
            w.write_value(this);
            w.write_values(method_args);
        }
        let replies = self
            .request_async(command_set::VM, vm::INVOKE_METHODS, w.into_vec(), methods.len())
            .await?;
        Ok(InvokeBatch {
            conn: self.clone(),
            thread,
            flags,
            len: methods.len(),
            replies,
        })
    }

    /// Abort an invoke by request id. Aborting an invoke that already
    /// finished is a no-op.
    pub async fn abort_invoke(&self, thread: ThreadId, request_id: u32) -> Result<()> {
        self.require(Feature::AbortInvoke)?;
        let mut w = DwpWriter::new();
        w.write_id(thread);
        w.write_i32(request_id as i32);
        match self
            .request(command_set::VM, vm::ABORT_INVOKE, w.into_vec())
            .await
        {
            Ok(_) => Ok(()),
            Err(DwpError::CommandFailed {
                error_code: status::NO_INVOCATION,
                ..
            }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::mock::{MockVm, MockVmConfig, HANGING_METHOD, THROWING_METHOD};
    use crate::types::VersionInfo;
    use tokio::sync::mpsc;

    async fn connect(config: MockVmConfig) -> (Connection, MockVm) {
        let (stream, mock) = MockVm::spawn(config);
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Connection::connect(stream, ConnectionConfig::default(), tx)
            .await
            .unwrap();
        (conn, mock)
    }

    #[test]
    fn options_map_to_flag_bits() {
        let options = InvokeOptions {
            disable_breakpoints: true,
            return_out_args: true,
            virtual_call: true,
            ..Default::default()
        };
        assert_eq!(options.bits(), 1 | 8 | 16);
        assert_eq!(InvokeOptions::default().bits(), 0);
    }

    #[tokio::test]
    async fn invoke_returns_value_and_out_parameters() {
        let (conn, _vm) = connect(MockVmConfig::default()).await;
        let this = Value::I4(9);
        let args = [Value::I8(1), Value::string(3)];
        let pending = conn
            .invoke_method(
                1,
                42,
                &this,
                &args,
                InvokeOptions {
                    return_out_this: true,
                    return_out_args: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let result = pending.wait().await.unwrap();
        assert_eq!(result.returned(), Some(&Value::I4(42)));
        assert_eq!(result.out_this, Some(this));
        assert_eq!(result.out_args, Some(args.to_vec()));
    }

    #[tokio::test]
    async fn invoke_reports_thrown_exception() {
        let (conn, _vm) = connect(MockVmConfig::default()).await;
        let result = conn
            .invoke_method(1, THROWING_METHOD, &Value::Null, &[], InvokeOptions::default())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(result.returned().is_none());
        assert!(result.exception().unwrap().object_id().is_some());
        assert_eq!(result.out_this, None);
        assert_eq!(result.out_args, None);
    }

    #[tokio::test]
    async fn multi_invoke_on_old_peer_fails_without_sending() {
        let (conn, mock) = connect(MockVmConfig {
            version: VersionInfo::new(2, 45),
            ..Default::default()
        })
        .await;

        let err = conn
            .invoke_methods(1, &[10, 11], &Value::Null, &[vec![], vec![]], InvokeOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            DwpError::NotSupported { required, negotiated, .. }
                if required == VersionInfo::new(2, 47) && negotiated == VersionInfo::new(2, 45)
        ));

        // A later round trip proves the peer has seen everything we sent.
        conn.vm_resume().await.unwrap();
        assert_eq!(mock.count(command_set::VM, vm::INVOKE_METHODS), 0);
    }

    #[tokio::test]
    async fn multi_invoke_delivers_items_then_batch() {
        let (conn, mock) = connect(MockVmConfig::default()).await;
        let mut batch = conn
            .invoke_methods(
                1,
                &[10, 11, 12],
                &Value::Null,
                &[vec![], vec![Value::I4(1)], vec![]],
                InvokeOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(batch.len(), 3);

        let first = batch.next_item().await.unwrap().unwrap();
        assert_eq!(first.returned(), Some(&Value::I4(10)));
        assert_eq!(batch.remaining(), 2);

        let rest = batch.wait_all().await.unwrap();
        let values: Vec<_> = rest.iter().map(|r| r.returned().cloned()).collect();
        assert_eq!(values, vec![Some(Value::I4(11)), Some(Value::I4(12))]);
        assert_eq!(mock.count(command_set::VM, vm::INVOKE_METHODS), 1);
    }

    #[tokio::test]
    async fn abort_unblocks_a_hanging_invoke() {
        let (conn, _vm) = connect(MockVmConfig::default()).await;
        let pending = conn
            .invoke_method(1, HANGING_METHOD, &Value::Null, &[], InvokeOptions::default())
            .await
            .unwrap();
        pending.abort().await.unwrap();
        assert!(matches!(pending.wait().await, Err(DwpError::InvokeAborted)));
    }

    #[tokio::test]
    async fn aborting_a_finished_invoke_is_a_no_op() {
        let (conn, _vm) = connect(MockVmConfig::default()).await;
        let pending = conn
            .invoke_method(1, 7, &Value::Null, &[], InvokeOptions::default())
            .await
            .unwrap();
        let id = pending.request_id();
        pending.wait().await.unwrap();
        conn.abort_invoke(1, id).await.unwrap();
    }
}
