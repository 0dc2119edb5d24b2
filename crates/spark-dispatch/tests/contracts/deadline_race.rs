#[path = "support/mod.rs"]
mod support;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use serde_json::json;
use spark_dispatch::{CallError, Deadline, ErrorCode, Next, Resume, Responder, from_fn};

use support::{Log, bind_add, connected, outcomes, recorder, shared_vec};

/// 将 Responder 暂存起来，模拟尚未完成的异步 Handler。
fn parking_handler(slot: &Arc<Mutex<Vec<Responder>>>) -> impl Fn(spark_dispatch::InboundCall, Responder) + Send + Sync + 'static {
    let slot = Arc::clone(slot);
    move |_, responder| slot.lock().push(responder)
}

/// 截止先于 Handler 完成：调用方恰好收到一次 `DEADLINE_EXPIRED`，迟到的成功响应被丢弃。
///
/// # 教案式说明
/// - **意图（Why）**：验证“先到者生效，后到者丢弃”的竞态裁决；
/// - **逻辑（How）**：Handler 暂存 Responder；到期后再让它回复成功；
/// - **契约（What）**：回调只触发一次且为 `DEADLINE_EXPIRED`；等待表与截止监听都被清理干净，
///   客户端上行处理照常观察到该错误。
#[test]
fn expiry_before_reply_wins_and_late_reply_is_ignored() {
    let (client, server, channel) = connected();
    let parked = shared_vec::<Responder>();
    server
        .on_message()
        .bind("add", parking_handler(&parked))
        .expect("add is declared");
    let log: Log = shared_vec();
    client.use_middleware(recorder("C", &log));

    let deadline = Deadline::new();
    let (seen, callback) = outcomes();
    client
        .emit_message()
        .with_deadline(deadline.clone())
        .call("add", vec![json!(1), json!(2)], callback);
    assert!(seen.lock().is_empty());
    assert_eq!(channel.pending_calls(), 1);

    assert!(deadline.expire());
    {
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0].as_ref().expect_err("deadline fired first").code(),
            ErrorCode::DeadlineExpired
        );
    }
    assert_eq!(log.lock().as_slice(), ["C-in", "C-out"]);
    assert_eq!(channel.pending_calls(), 0);
    assert_eq!(deadline.listener_count(), 0);

    let responder = parked.lock().pop().expect("handler parked its responder");
    responder.reply(json!(3));
    assert_eq!(seen.lock().len(), 1, "迟到的响应不得再次触发回调");
}

/// Handler 自行终止截止令牌：客户端报告 `DEADLINE_EXPIRED`，而非 Handler 返回的结果。
#[test]
fn handler_terminating_the_deadline_is_reported_as_expiry() {
    let (client, server, _channel) = connected();
    let deadline = Deadline::new();
    let shared = deadline.clone();
    server
        .on_message()
        .bind("add", move |_, responder| {
            shared.expire();
            responder.reply(json!("too late"));
        })
        .expect("add is declared");

    let (seen, callback) = outcomes();
    client
        .emit_message()
        .with_deadline(deadline)
        .call("add", vec![json!(1), json!(2)], callback);

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0].as_ref().expect_err("deadline was terminated").code(),
        ErrorCode::DeadlineExpired
    );
}

#[test]
fn reply_before_expiry_wins_and_expiry_is_a_no_op_for_the_call() {
    let (client, server, _channel) = connected();
    bind_add(&server);
    let deadline = Deadline::new();

    let (seen, callback) = outcomes();
    client
        .emit_message()
        .with_deadline(deadline.clone())
        .call("add", vec![json!(1), json!(2)], callback);
    assert_eq!(deadline.listener_count(), 0, "完成的调用应注销监听");

    deadline.expire();
    assert_eq!(seen.lock().as_slice(), [Ok(Some(json!(3)))]);
}

#[test]
fn one_deadline_bounds_many_concurrent_calls() {
    let (client, server, channel) = connected();
    let parked = shared_vec::<Responder>();
    server
        .on_message()
        .bind("add", parking_handler(&parked))
        .expect("add is declared");

    let deadline = Deadline::new();
    let invoker = client.emit_message().with_deadline(deadline.clone());
    let results = shared_vec();
    for i in 0..5 {
        let sink = Arc::clone(&results);
        invoker.call("add", vec![json!(i), json!(i)], move |outcome| {
            sink.lock().push(outcome)
        });
    }
    assert_eq!(channel.pending_calls(), 5);

    deadline.expire();
    let results = results.lock();
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|outcome: &Result<_, CallError>| {
        matches!(outcome, Err(error) if error.code() == ErrorCode::DeadlineExpired)
    }));
    assert_eq!(channel.pending_calls(), 0);
}

#[test]
fn retry_after_expiry_fails_fast_without_resending() {
    let (client, server, _channel) = connected();
    let parked = shared_vec::<Responder>();
    server
        .on_message()
        .bind("add", parking_handler(&parked))
        .expect("add is declared");

    let resent = shared_vec::<usize>();
    let counter = Arc::clone(&resent);
    client.use_middleware(spark_dispatch::from_fn(move |_, next| {
        let again = next.clone();
        let counter = Arc::clone(&counter);
        next.proceed_then(move |error, resume| {
            if error.is_some() && counter.lock().is_empty() {
                counter.lock().push(1);
                again.envelope().clear_error();
                again.proceed();
            } else {
                resume.resume();
            }
        });
    }));

    let deadline = Deadline::new();
    let (seen, callback) = outcomes();
    client
        .emit_message()
        .with_deadline(deadline.clone())
        .call("add", vec![json!(1), json!(1)], callback);
    deadline.expire();

    assert_eq!(parked.lock().len(), 1, "到期后的重试不应再次发送");
    assert_eq!(resent.lock().len(), 1);
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0].as_ref().expect_err("expired").code(),
        ErrorCode::DeadlineExpired
    );
}

/// 响应已到达、上行处理尚未恢复时到期：到期不改写已经得出的结论。
///
/// # 教案式说明
/// - **意图（Why）**：“先到者生效”以响应到达为界；上行处理可以是异步的（例如写审计日志后再放行），
///   它挂起期间的到期不应把成功改写成超时；
/// - **逻辑（How）**：外层记录器之内的中间件在 `proceed_then` 中暂存 `Resume`，Handler 同步回复 3；
///   随后令截止到期，再放行暂存的 `Resume`；
/// - **契约（What）**：调用方恰好收到一次 `Ok(Some(3))`，外层上行处理照常执行，截止监听被清理。
#[test]
fn expiry_while_an_upstream_handler_is_deferred_keeps_the_response() {
    let (client, server, _channel) = connected();
    bind_add(&server);
    let log: Log = shared_vec();
    client.use_middleware(recorder("C", &log));
    let parked = shared_vec::<Resume>();
    let slot = Arc::clone(&parked);
    client.use_middleware(from_fn(move |_, next| {
        let slot = Arc::clone(&slot);
        next.proceed_then(move |_, resume| slot.lock().push(resume));
    }));

    let deadline = Deadline::new();
    let (seen, callback) = outcomes();
    client
        .emit_message()
        .with_deadline(deadline.clone())
        .call("add", vec![json!(1), json!(2)], callback);
    assert!(seen.lock().is_empty(), "上行处理尚未放行");

    assert!(deadline.expire());
    assert!(seen.lock().is_empty(), "响应已到达，到期不应结束调用");

    let resume = parked.lock().pop().expect("upstream handler parked its resume");
    resume.resume();
    assert_eq!(seen.lock().as_slice(), [Ok(Some(json!(3)))]);
    assert_eq!(log.lock().as_slice(), ["C-in", "C-out"]);
    assert_eq!(deadline.listener_count(), 0);
}

/// 重试让调用回到下行阶段：此时到期仍以 `DEADLINE_EXPIRED` 结束调用。
#[test]
fn expiry_after_a_retry_redescends_resolves_the_call() {
    let (client, server, channel) = connected();
    server
        .on_message()
        .bind("add", |_, responder| {
            responder.fail(CallError::application("BUSY", "try again"))
        })
        .expect("add is declared");

    client.use_middleware(from_fn(|_, next| {
        let again = next.clone();
        next.proceed_then(move |error, resume| {
            if error.is_some() && again.attempts() < 2 {
                again.envelope().clear_error();
                again.proceed();
            } else {
                resume.resume();
            }
        });
    }));
    let passes = Arc::new(AtomicUsize::new(0));
    let stalled = shared_vec::<Next>();
    let (counter, slot) = (Arc::clone(&passes), Arc::clone(&stalled));
    client.use_middleware(from_fn(move |_, next| {
        if counter.fetch_add(1, Ordering::AcqRel) == 0 {
            next.proceed();
        } else {
            slot.lock().push(next);
        }
    }));

    let deadline = Deadline::new();
    let (seen, callback) = outcomes();
    client
        .emit_message()
        .with_deadline(deadline.clone())
        .call("add", vec![json!(1), json!(1)], callback);
    assert_eq!(passes.load(Ordering::Acquire), 2);
    assert_eq!(stalled.lock().len(), 1);
    assert!(seen.lock().is_empty());

    deadline.expire();
    {
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0].as_ref().expect_err("retry stalled before sending").code(),
            ErrorCode::DeadlineExpired
        );
    }
    assert_eq!(channel.pending_calls(), 0);
    assert_eq!(deadline.listener_count(), 0);
}
