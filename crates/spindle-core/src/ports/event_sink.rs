//! EventSink port - イベント記録の抽象化
//!
//! # 実装
//! - `impls::TracingEventSink`: tracing へ構造化ログとして出力（既定）
//! - `impls::RecordingEventSink`: メモリに溜める（テスト用）

use crate::domain::DomainEvent;

/// EventSink はドメインイベントを記録
///
/// 同期メソッドです。engine のロックや store のトランザクションを持ったまま
/// 呼ばれることはありませんが、重い処理はしないでください。
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}
