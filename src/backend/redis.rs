//! Backing-node client over the Redis protocol.

use super::{NodeClient, NodeDialer, Reply};
use crate::error::{Error, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Value;
use std::time::Duration;

/// Dialer producing clients backed by multiplexed Redis connections.
#[derive(Debug, Clone)]
pub struct RedisDialer {
    /// Applied to every dial and every in-flight command.
    response_timeout: Duration,
}

impl Default for RedisDialer {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(1),
        }
    }
}

impl RedisDialer {
    /// Create a dialer with the default response timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-operation timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

#[async_trait]
impl NodeDialer for RedisDialer {
    async fn dial(&self, addr: &str) -> Result<Box<dyn NodeClient>> {
        let client = redis::Client::open(format!("redis://{}", addr))?;
        let conn = tokio::time::timeout(
            self.response_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| Error::Transport(format!("dial timeout to {}", addr)))??;
        Ok(Box::new(RedisNodeClient {
            conn,
            response_timeout: self.response_timeout,
        }))
    }
}

/// One multiplexed connection to a Redis node.
pub struct RedisNodeClient {
    conn: MultiplexedConnection,
    response_timeout: Duration,
}

impl RedisNodeClient {
    fn convert(value: Value) -> Reply {
        match value {
            Value::Nil => Reply::Nil,
            Value::Int(n) => Reply::Int(n),
            Value::Data(bytes) => Reply::Bulk(bytes),
            Value::Status(s) => Reply::Simple(s),
            Value::Okay => Reply::Simple("OK".to_string()),
            Value::Bulk(items) => {
                Reply::Array(items.into_iter().map(Self::convert).collect())
            }
        }
    }
}

#[async_trait]
impl NodeClient for RedisNodeClient {
    async fn command(&mut self, cmd: &str, args: &[Vec<u8>]) -> Result<Reply> {
        let mut command = redis::cmd(cmd);
        for arg in args {
            command.arg(arg.as_slice());
        }
        let fut = async {
            let value: Value = command.query_async(&mut self.conn).await?;
            Ok::<_, Error>(value)
        };
        let value = tokio::time::timeout(self.response_timeout, fut)
            .await
            .map_err(|_| Error::Transport(format!("{} timed out", cmd)))??;
        Ok(Self::convert(value))
    }

    async fn eval(&mut self, script: &str, keys: &[&[u8]], args: &[Vec<u8>]) -> Result<Reply> {
        // `redis::Script` invokes by digest and falls back to sending the
        // source when the node has not cached it yet.
        let script = redis::Script::new(script);
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(arg.as_slice());
        }
        let fut = async {
            let value: Value = invocation.invoke_async(&mut self.conn).await?;
            Ok::<_, Error>(value)
        };
        let value = tokio::time::timeout(self.response_timeout, fut)
            .await
            .map_err(|_| Error::Transport("script evaluation timed out".to_string()))??;
        Ok(Self::convert(value))
    }
}
