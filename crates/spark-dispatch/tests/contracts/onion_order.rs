#[path = "support/mod.rs"]
mod support;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use proptest::prelude::*;
use serde_json::json;
use spark_dispatch::{CallError, ErrorCode, Middleware, Next, from_fn};

use support::{Log, bind_add, connected, outcomes, recorder, shared_vec};

fn expected_order(client: usize, server: usize) -> Vec<String> {
    let mut order = Vec::new();
    order.extend((0..client).map(|i| format!("C{i}-in")));
    order.extend((0..server).map(|i| format!("S{i}-in")));
    order.push("H".to_owned());
    order.extend((0..server).rev().map(|i| format!("S{i}-out")));
    order.extend((0..client).rev().map(|i| format!("C{i}-out")));
    order
}

/// 有界重试中间件：上游观察到错误时清空错误并重新推进，最多 `bound` 次。
fn retry(bound: usize) -> impl Middleware {
    fn attempt(next: Next, remaining: usize) {
        let again = next.clone();
        next.proceed_then(move |error, resume| {
            if error.is_some() && remaining > 1 {
                again.envelope().clear_error();
                attempt(again, remaining - 1);
            } else {
                resume.resume();
            }
        });
    }
    from_fn(move |_, next| attempt(next, bound)).named("retry")
}

/// 验证两侧中间件与 Handler 构成严格的洋葱嵌套。
///
/// # 教案式说明
/// - **意图（Why）**：洋葱顺序是中间件语义的根基，重试、鉴权、埋点都依赖“先进后出”的对称性；
/// - **逻辑（How）**：客户端 `[C0, C1]`、服务端 `[S0, S1]` 全部写入同一事件日志，Handler 写入 `H`；
/// - **契约（What）**：日志必须与 `C0..C1, S0..S1, H, S1..S0, C1..C0` 完全一致，且调用成功。
#[test]
fn both_stacks_nest_strictly_around_the_handler() {
    let (client, server, _channel) = connected();
    let log: Log = shared_vec();
    for i in 0..2 {
        client.use_middleware(recorder(format!("C{i}"), &log));
        server.use_middleware(recorder(format!("S{i}"), &log));
    }
    let handler_log = Arc::clone(&log);
    server
        .on_message()
        .bind("add", move |_, responder| {
            handler_log.lock().push("H".to_owned());
            responder.reply(json!(3));
        })
        .expect("add is declared");

    let (seen, callback) = outcomes();
    client.emit_message().call("add", vec![json!(1), json!(2)], callback);

    assert_eq!(*log.lock(), expected_order(2, 2));
    assert_eq!(seen.lock().as_slice(), [Ok(Some(json!(3)))]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// 任意层数 `k ≥ 0` 下洋葱顺序都成立。
    #[test]
    fn onion_order_holds_for_any_stack_depth(client_depth in 0usize..6, server_depth in 0usize..6) {
        let (client, server, _channel) = connected();
        let log: Log = shared_vec();
        for i in 0..client_depth {
            client.use_middleware(recorder(format!("C{i}"), &log));
        }
        for i in 0..server_depth {
            server.use_middleware(recorder(format!("S{i}"), &log));
        }
        let handler_log = Arc::clone(&log);
        server
            .on_message()
            .bind("add", move |_, responder| {
                handler_log.lock().push("H".to_owned());
                responder.reply(json!(0));
            })
            .expect("add is declared");

        let (seen, callback) = outcomes();
        client.emit_message().call("add", vec![json!(0), json!(0)], callback);

        prop_assert_eq!(log.lock().clone(), expected_order(client_depth, server_depth));
        prop_assert_eq!(seen.lock().len(), 1);
    }
}

#[test]
fn unbound_message_is_not_implemented_after_full_onion() {
    let (client, server, _channel) = connected();
    let log: Log = shared_vec();
    client.use_middleware(recorder("C0", &log));
    server.use_middleware(recorder("S0", &log));

    let (seen, callback) = outcomes();
    client.emit_message().call("unbound", Vec::new(), callback);

    assert_eq!(
        log.lock().as_slice(),
        ["C0-in", "S0-in", "S0-out", "C0-out"]
    );
    let seen = seen.lock();
    let error = seen[0].as_ref().expect_err("no handler is bound");
    assert_eq!(error.code(), ErrorCode::NotImplemented);
    assert_eq!(error.application_code(), None);
}

#[test]
fn middleware_added_after_binding_still_wraps_the_handler() {
    let (client, server, _channel) = connected();
    bind_add(&server);
    let log: Log = shared_vec();
    server.use_middleware(recorder("late", &log));

    let (seen, callback) = outcomes();
    client.emit_message().call("add", vec![json!(2), json!(2)], callback);

    assert_eq!(log.lock().as_slice(), ["late-in", "late-out"]);
    assert_eq!(seen.lock().as_slice(), [Ok(Some(json!(4)))]);
}

#[test]
fn per_call_middleware_is_innermost_and_does_not_persist() {
    let (client, server, _channel) = connected();
    bind_add(&server);
    let log: Log = shared_vec();
    client.use_middleware(recorder("outer", &log));

    let (_, callback) = outcomes();
    client
        .emit_message()
        .with_middleware(recorder("call", &log))
        .call("add", vec![json!(1), json!(1)], callback);
    assert_eq!(
        log.lock().as_slice(),
        ["outer-in", "call-in", "call-out", "outer-out"]
    );

    log.lock().clear();
    let (_, callback) = outcomes();
    client.emit_message().call("add", vec![json!(1), json!(1)], callback);
    assert_eq!(log.lock().as_slice(), ["outer-in", "outer-out"]);
    assert_eq!(client.middleware().len(), 1);
}

/// 验证有界重试：底层操作在第 `n` 次成功时调用成功，且推进次数不超过上限。
#[test]
fn bounded_retry_succeeds_on_the_last_allowed_attempt() {
    let (client, server, _channel) = connected();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    server
        .on_message()
        .bind("add", move |_, responder| {
            if counter.fetch_add(1, Ordering::AcqRel) + 1 < 3 {
                responder.fail(CallError::application("BUSY", "try again"));
            } else {
                responder.reply(json!("ok"));
            }
        })
        .expect("add is declared");
    client.use_middleware(retry(3));

    let (seen, callback) = outcomes();
    client.emit_message().call("add", vec![json!(1), json!(1)], callback);

    assert_eq!(attempts.load(Ordering::Acquire), 3);
    assert_eq!(seen.lock().as_slice(), [Ok(Some(json!("ok")))]);
}

#[test]
fn bounded_retry_never_exceeds_its_bound() {
    let (client, server, _channel) = connected();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    server
        .on_message()
        .bind("add", move |_, responder| {
            counter.fetch_add(1, Ordering::AcqRel);
            responder.fail(CallError::application("BUSY", "still busy"));
        })
        .expect("add is declared");
    client.use_middleware(retry(4));

    let (seen, callback) = outcomes();
    client.emit_message().call("add", vec![json!(1), json!(1)], callback);

    assert_eq!(attempts.load(Ordering::Acquire), 4);
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0].as_ref().expect_err("every attempt failed").application_code(),
        Some("BUSY")
    );
}

/// 同步回环上的深度重试不会累积调用栈。
///
/// # 教案式说明
/// - **意图（Why）**：进程内 Channel 会在发送方线程上同步完成整个往返，
///   若每次重试都嵌套在上一次的上行处理之中，重试上限就受制于线程栈深度；
/// - **逻辑（How）**：两侧各装一层透传中间件，Handler 永远失败，客户端重试一万次；
/// - **契约（What）**：Handler 恰好执行一万次，调用方收到一次最后的业务错误，等待表清空。
#[test]
fn deep_retry_over_a_synchronous_channel_keeps_the_stack_flat() {
    const BOUND: usize = 10_000;
    let (client, server, channel) = connected();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    server.use_middleware(from_fn(|_, next| next.proceed()));
    server
        .on_message()
        .bind("add", move |_, responder| {
            counter.fetch_add(1, Ordering::AcqRel);
            responder.fail(CallError::application("BUSY", "still busy"));
        })
        .expect("add is declared");
    client.use_middleware(from_fn(|_, next| next.proceed()));
    client.use_middleware(retry(BOUND));

    let (seen, callback) = outcomes();
    client.emit_message().call("add", vec![json!(1), json!(1)], callback);

    assert_eq!(attempts.load(Ordering::Acquire), BOUND);
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0].as_ref().expect_err("every attempt failed").application_code(),
        Some("BUSY")
    );
    assert_eq!(channel.pending_calls(), 0);
}

#[test]
fn middleware_raised_error_reaches_the_caller_with_its_code() {
    let (client, server, _channel) = connected();
    bind_add(&server);
    let log: Log = shared_vec();
    client.use_middleware(recorder("outer", &log));
    server.use_middleware(from_fn(|_, next| {
        next.fail(CallError::application("UNAUTHORIZED", "missing token"));
    }));
    server.use_middleware(recorder("skipped", &log));

    let (seen, callback) = outcomes();
    client.emit_message().call("add", vec![json!(1), json!(1)], callback);

    assert_eq!(log.lock().as_slice(), ["outer-in", "outer-out"]);
    let seen = seen.lock();
    let error = seen[0].as_ref().expect_err("middleware rejected the call");
    assert_eq!(error.code(), ErrorCode::ApplicationError);
    assert_eq!(error.application_code(), Some("UNAUTHORIZED"));
}
