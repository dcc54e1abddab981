//! 事件流发送端：每次运行或回放独占一条有序通道
//!
//! `close` 消费发送端并发出终止事件，之后无法再发送；发送端被 drop 即关闭通道。

use tokio::sync::mpsc;

use crate::react::FlowEvent;

/// 创建一条事件通道；`label` 用于日志（通常为 cacheKey）
pub fn event_channel(label: impl Into<String>) -> (EventEmitter, mpsc::UnboundedReceiver<FlowEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventEmitter {
            tx,
            label: label.into(),
        },
        rx,
    )
}

#[derive(Debug)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<FlowEvent>,
    label: String,
}

impl EventEmitter {
    /// 按顺序发送非终止事件；消费者已离开时只记录日志
    pub fn emit(&self, event: FlowEvent) {
        debug_assert!(!event.is_terminal(), "terminal events go through close()");
        self.send(event);
    }

    /// 发送终止事件并关闭通道
    pub fn close(self, terminal: FlowEvent) {
        debug_assert!(terminal.is_terminal(), "close() expects a terminal event");
        self.send(terminal);
    }

    pub fn consumer_gone(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, event: FlowEvent) {
        let kind = event.type_name();
        if self.tx.send(event).is_err() {
            tracing::debug!(stream = %self.label, event = kind, "event consumer gone, dropping event");
        }
    }
}
