//! Dispatching the real build phases.

use std::sync::Arc;

use keel_core::KeelError;
use keel_events::{
    BuildConsoleCommands, BuildRoutes, BuildView, CommandSet, EventBus, Subscriber, ViewContext,
};
use keel_middleware::{Request, RequestContext, Response, ResponseExt, RouteBuilder};
use parking_lot::Mutex;
use proptest::prelude::*;

async fn ok(_ctx: RequestContext, _req: Request) -> Result<Response, KeelError> {
    Ok(Response::text(http::StatusCode::OK, "ok"))
}

#[test]
fn build_routes_runs_by_priority() {
    let bus = EventBus::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    for priority in [0, -5, 10] {
        let order = Arc::clone(&order);
        bus.subscribe::<BuildRoutes, _>(format!("p{priority}"), priority, move |routes| {
            order.lock().push(priority);
            routes.get(&format!("/p{priority}"), ok);
            Ok(())
        });
    }

    let mut routes = RouteBuilder::new();
    bus.dispatch::<BuildRoutes>(&mut routes).unwrap();

    assert_eq!(*order.lock(), vec![10, 0, -5]);
    assert_eq!(routes.route_count(), 3);
}

#[test]
fn failing_handler_keeps_earlier_routes() {
    let bus = EventBus::new();
    bus.subscribe::<BuildRoutes, _>("app", 10, |routes| {
        routes.get("/", ok);
        Ok(())
    });
    bus.subscribe::<BuildRoutes, _>("plugin", 0, |_| {
        Err(KeelError::internal("plugin could not register"))
    });

    let mut routes = RouteBuilder::new();
    assert!(bus.dispatch::<BuildRoutes>(&mut routes).is_err());
    assert_eq!(routes.route_count(), 1);
}

struct Plugin;

impl Subscriber for Plugin {
    fn subscribe(self: Arc<Self>, bus: &EventBus) {
        bus.subscribe::<BuildConsoleCommands, _>("plugin", 0, |commands| {
            commands.command("plugin:hello", "Says hello", |_args: Vec<String>| async {
                Ok::<_, KeelError>(())
            });
            Ok(())
        });
        bus.subscribe::<BuildView, _>("plugin", 0, |view| view.insert("plugin", true));
    }
}

#[tokio::test]
async fn subscriber_contributes_to_several_phases() {
    let bus = EventBus::new();
    bus.add_subscriber(Arc::new(Plugin));

    let mut commands = CommandSet::new();
    bus.dispatch::<BuildConsoleCommands>(&mut commands).unwrap();
    commands.run("plugin:hello", Vec::new()).await.unwrap();

    let mut view = ViewContext::new();
    bus.dispatch::<BuildView>(&mut view).unwrap();
    assert_eq!(view.get("plugin"), Some(&serde_json::Value::Bool(true)));
}

#[test]
fn phases_are_independent() {
    let bus = EventBus::new();
    bus.subscribe::<BuildView, _>("view", 0, |view| view.insert("a", 1));

    let mut commands = CommandSet::new();
    bus.dispatch::<BuildConsoleCommands>(&mut commands).unwrap();

    assert!(commands.is_empty());
    assert!(bus.has_dispatched("build-console-commands"));
    assert!(!bus.has_dispatched("build-view"));
}

proptest! {
    #[test]
    fn dispatch_order_is_a_stable_sort_by_descending_priority(
        priorities in proptest::collection::vec(-20i32..20, 0..24)
    ) {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for (index, priority) in priorities.iter().copied().enumerate() {
            let seen = Arc::clone(&seen);
            bus.subscribe::<BuildView, _>(format!("h{index}"), priority, move |_| {
                seen.lock().push(index);
                Ok(())
            });
        }

        let mut view = ViewContext::new();
        bus.dispatch::<BuildView>(&mut view).unwrap();

        let mut expected: Vec<usize> = (0..priorities.len()).collect();
        expected.sort_by_key(|&index| std::cmp::Reverse(priorities[index]));
        prop_assert_eq!(seen.lock().clone(), expected);
    }
}
