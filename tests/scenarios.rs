//! The six literal end-to-end scenarios: simple accept, unaccepted, accepted
//! with an unrelated unupdated dependency, a recoverable link error, an
//! infinite `export *` self-cycle, and a declining module whose own accept
//! absorbs its child's update before decline ever applies. Plus coverage for
//! a real `accept(dep, cb)` callback actually firing, and evaluation-failure
//! rollback for both a single module and a genuine cyclic SCC.

use std::cell::Cell;
use std::rc::Rc;

use futures::executor::block_on;
use hotgraph::{
    Application, Body, ExportsHandle, HotError, ImportBinding, LoadedModuleRequestEntry, ModuleContext,
    ModuleDeclaration, ModuleFormat, ModuleRequest, Url, Value,
};
use hotgraph::error::UpdateOutcome;
use hotgraph::ids::ControllerId;

fn request(id: ControllerId, specifier: &str) -> ModuleRequest {
    ModuleRequest {
        specifier: specifier.into(),
        resolve: Rc::new(move || id),
    }
}

fn base_decl(url: &str, body: Body) -> ModuleDeclaration {
    ModuleDeclaration {
        url: Url::new(url),
        body,
        meta: None,
        format: ModuleFormat::EsModule,
        import_assertions: Default::default(),
        uses_dynamic_import: false,
        loaded_modules: Vec::new(),
        local_export_names: Vec::new(),
        indirect_export_entries: Default::default(),
        star_export_entries: Vec::new(),
    }
}

fn counting_body(calls: Rc<Cell<u32>>, export_name: Option<&'static str>, export_value: i64) -> Body {
    Body::Sync(Rc::new(move |_ctx: &ModuleContext, exports: &ExportsHandle, _hot| {
        calls.set(calls.get() + 1);
        if let Some(name) = export_name {
            exports.set(name, Rc::new(export_value) as Value);
        }
        Ok(())
    }))
}

fn self_accepting_body(calls: Rc<Cell<u32>>) -> Body {
    Body::Sync(Rc::new(move |_ctx: &ModuleContext, _exports: &ExportsHandle, hot| {
        calls.set(calls.get() + 1);
        hot.accept_self(None);
        Ok(())
    }))
}

#[test]
fn s1_self_accept_absorbs_child_bubble() {
    let app = Rc::new(Application::new());
    let child_id = app.acquire("child");
    let main_id = app.acquire("main");
    app.set_root(main_id);

    let child_calls = Rc::new(Cell::new(0u32));
    let mut child_v1 = base_decl("child", counting_body(child_calls.clone(), Some("counter"), 1));
    child_v1.local_export_names.push("counter".into());
    app.load(child_id, Rc::new(child_v1), None);

    let main_calls = Rc::new(Cell::new(0u32));
    let mut main_decl = base_decl("main", self_accepting_body(main_calls.clone()));
    main_decl.loaded_modules.push(LoadedModuleRequestEntry {
        request: request(child_id, "child"),
        bindings: vec![ImportBinding::Named {
            imported: "counter".into(),
            local: "counter".into(),
        }],
    });
    app.load(main_id, Rc::new(main_decl), None);

    block_on(app.dispatch()).expect("initial dispatch links and evaluates");
    assert_eq!(child_calls.get(), 1);
    assert_eq!(main_calls.get(), 1);

    let mut child_v2 = base_decl("child", counting_body(child_calls.clone(), Some("counter"), 2));
    child_v2.local_export_names.push("counter".into());
    app.load(child_id, Rc::new(child_v2), None);

    let outcome = block_on(app.request_update());
    assert!(matches!(outcome, Some(UpdateOutcome::Success { .. })), "{outcome:?}");
    assert_eq!(child_calls.get(), 2, "child re-evaluates on its own change");
    assert_eq!(main_calls.get(), 2, "self-accept absorbs the bubble by re-running itself");
}

#[test]
fn s2_unaccepted_bubble_reaches_root() {
    let app = Rc::new(Application::new());
    let child_id = app.acquire("child");
    let main_id = app.acquire("main");
    app.set_root(main_id);

    let child_calls = Rc::new(Cell::new(0u32));
    let mut child_v1 = base_decl("child", counting_body(child_calls.clone(), Some("counter"), 1));
    child_v1.local_export_names.push("counter".into());
    app.load(child_id, Rc::new(child_v1), None);

    let main_calls = Rc::new(Cell::new(0u32));
    let mut main_decl = base_decl("main", counting_body(main_calls.clone(), None, 0));
    main_decl.loaded_modules.push(LoadedModuleRequestEntry {
        request: request(child_id, "child"),
        bindings: vec![ImportBinding::Named {
            imported: "counter".into(),
            local: "counter".into(),
        }],
    });
    app.load(main_id, Rc::new(main_decl), None);

    block_on(app.dispatch()).expect("initial dispatch links and evaluates");
    assert_eq!(main_calls.get(), 1);

    let mut child_v2 = base_decl("child", counting_body(child_calls.clone(), Some("counter"), 2));
    child_v2.local_export_names.push("counter".into());
    app.load(child_id, Rc::new(child_v2), None);

    let outcome = block_on(app.request_update());
    assert!(matches!(outcome, Some(UpdateOutcome::Unaccepted { .. })), "{outcome:?}");
    assert_eq!(main_calls.get(), 1, "main never re-ran: the update never committed");
}

#[test]
fn s3_specific_accept_does_not_rerun_importer() {
    let app = Rc::new(Application::new());
    let updated_id = app.acquire("updated");
    let unupdated_id = app.acquire("unupdated");
    let main_id = app.acquire("main");
    app.set_root(main_id);

    let updated_calls = Rc::new(Cell::new(0u32));
    app.load(
        updated_id,
        Rc::new(base_decl("updated", counting_body(updated_calls.clone(), Some("value"), 1))),
        None,
    );
    let unupdated_calls = Rc::new(Cell::new(0u32));
    app.load(
        unupdated_id,
        Rc::new(base_decl("unupdated", counting_body(unupdated_calls.clone(), Some("value"), 1))),
        None,
    );

    let main_calls = Rc::new(Cell::new(0u32));
    let updated_url = Url::new("updated");
    let unupdated_url = Url::new("unupdated");
    let main_body = {
        let main_calls = main_calls.clone();
        Body::Sync(Rc::new(move |_ctx: &ModuleContext, _exports: &ExportsHandle, hot| {
            main_calls.set(main_calls.get() + 1);
            hot.accept_deps(vec![updated_url.clone(), unupdated_url.clone()], None);
            Ok(())
        }))
    };
    let mut main_decl = base_decl("main", main_body);
    main_decl.loaded_modules.push(LoadedModuleRequestEntry {
        request: request(updated_id, "updated"),
        bindings: vec![ImportBinding::Named { imported: "value".into(), local: "updated".into() }],
    });
    main_decl.loaded_modules.push(LoadedModuleRequestEntry {
        request: request(unupdated_id, "unupdated"),
        bindings: vec![ImportBinding::Named { imported: "value".into(), local: "unupdated".into() }],
    });
    app.load(main_id, Rc::new(main_decl), None);

    block_on(app.dispatch()).expect("initial dispatch links and evaluates");
    assert_eq!(main_calls.get(), 1);

    app.load(
        updated_id,
        Rc::new(base_decl("updated", counting_body(updated_calls.clone(), Some("value"), 2))),
        None,
    );

    let outcome = block_on(app.request_update());
    assert!(matches!(outcome, Some(UpdateOutcome::Success { .. })), "{outcome:?}");
    assert_eq!(updated_calls.get(), 2);
    assert_eq!(unupdated_calls.get(), 1, "unupdated dependency was never touched");
    assert_eq!(main_calls.get(), 1, "specific accept(dep) never reruns the importer");
}

#[test]
fn s4_link_error_then_recovery() {
    let app = Rc::new(Application::new());
    let child_id = app.acquire("child");
    let main_id = app.acquire("main");
    app.set_root(main_id);

    let mut child_v1 = base_decl("child", Body::Sync(Rc::new(|_ctx, exports: &ExportsHandle, _hot| {
        exports.set("symbol", Rc::new(1i64) as Value);
        Ok(())
    })));
    child_v1.local_export_names.push("symbol".into());
    app.load(child_id, Rc::new(child_v1), None);

    let main_calls = Rc::new(Cell::new(0u32));
    let mut main_decl_v1 = base_decl("main", self_accepting_body(main_calls.clone()));
    main_decl_v1.loaded_modules.push(LoadedModuleRequestEntry {
        request: request(child_id, "child"),
        bindings: vec![ImportBinding::Named { imported: "symbol".into(), local: "symbol".into() }],
    });
    app.load(main_id, Rc::new(main_decl_v1), None);

    block_on(app.dispatch()).expect("initial dispatch links and evaluates");
    assert_eq!(main_calls.get(), 1);

    // Child drops the `symbol` export entirely.
    let child_v2 = base_decl("child", Body::Sync(Rc::new(|_ctx, _exports, _hot| Ok(()))));
    app.load(child_id, Rc::new(child_v2), None);

    let outcome = block_on(app.request_update());
    assert!(matches!(outcome, Some(UpdateOutcome::LinkError { .. })), "{outcome:?}");
    assert_eq!(main_calls.get(), 1, "link-test purity: no user code ran");

    // Main stops importing the removed binding.
    let main_decl_v2 = base_decl("main", self_accepting_body(main_calls.clone()));
    app.load(main_id, Rc::new(main_decl_v2), None);

    let outcome = block_on(app.request_update());
    assert!(matches!(outcome, Some(UpdateOutcome::Success { .. })), "{outcome:?}");
    assert_eq!(main_calls.get(), 2, "main's own new code is what gets re-evaluated this time");
}

#[test]
fn s5_self_star_export_rejected_at_dispatch() {
    let app = Rc::new(Application::new());
    let child_id = app.acquire("child");
    app.set_root(child_id);

    let mut child_decl = base_decl("child", Body::Sync(Rc::new(|_ctx, _exports, _hot| Ok(()))));
    child_decl.star_export_entries.push(hotgraph::StarExportEntry {
        request: request(child_id, "child"),
    });
    app.load(child_id, Rc::new(child_decl), None);

    let result = block_on(app.dispatch());
    assert!(matches!(result, Err(HotError::Link { .. })), "{result:?}");
}

#[test]
fn s6_decline_never_fires_when_accept_covers_the_change() {
    let app = Rc::new(Application::new());
    let grandchild_id = app.acquire("grandchild");
    let middle_id = app.acquire("middle");
    app.set_root(middle_id);

    let grandchild_calls = Rc::new(Cell::new(0u32));
    let mut grandchild_v1 = base_decl(
        "grandchild",
        counting_body(grandchild_calls.clone(), Some("value"), 1),
    );
    grandchild_v1.local_export_names.push("value".into());
    app.load(grandchild_id, Rc::new(grandchild_v1), None);

    let middle_calls = Rc::new(Cell::new(0u32));
    let grandchild_url = Url::new("grandchild");
    let middle_body = {
        let middle_calls = middle_calls.clone();
        Body::Sync(Rc::new(move |_ctx: &ModuleContext, _exports: &ExportsHandle, hot| {
            middle_calls.set(middle_calls.get() + 1);
            hot.decline();
            hot.accept_deps(vec![grandchild_url.clone()], None);
            Ok(())
        }))
    };
    let mut middle_decl = base_decl("middle", middle_body);
    middle_decl.loaded_modules.push(LoadedModuleRequestEntry {
        request: request(grandchild_id, "grandchild"),
        bindings: vec![ImportBinding::Named { imported: "value".into(), local: "value".into() }],
    });
    app.load(middle_id, Rc::new(middle_decl), None);

    block_on(app.dispatch()).expect("initial dispatch links and evaluates");
    assert_eq!(middle_calls.get(), 1);

    let mut grandchild_v2 = base_decl(
        "grandchild",
        counting_body(grandchild_calls.clone(), Some("value"), 2),
    );
    grandchild_v2.local_export_names.push("value".into());
    app.load(grandchild_id, Rc::new(grandchild_v2), None);

    let outcome = block_on(app.request_update());
    assert!(matches!(outcome, Some(UpdateOutcome::Success { .. })), "{outcome:?}");
    assert_eq!(grandchild_calls.get(), 2);
    assert_eq!(middle_calls.get(), 1, "middle's decline never applied: it was never invalidated");
}

#[test]
fn s7_specific_accept_callback_is_invoked_with_changed_dependency() {
    let app = Rc::new(Application::new());
    let dep_id = app.acquire("dep");
    let main_id = app.acquire("main");
    app.set_root(main_id);

    let dep_calls = Rc::new(Cell::new(0u32));
    app.load(
        dep_id,
        Rc::new(base_decl("dep", counting_body(dep_calls.clone(), Some("value"), 1))),
        None,
    );

    let main_calls = Rc::new(Cell::new(0u32));
    let callback_calls = Rc::new(Cell::new(0u32));
    let dep_url = Url::new("dep");
    let main_body = {
        let main_calls = main_calls.clone();
        let callback_calls = callback_calls.clone();
        let dep_url = dep_url.clone();
        Body::Sync(Rc::new(move |_ctx: &ModuleContext, _exports: &ExportsHandle, hot| {
            main_calls.set(main_calls.get() + 1);
            let callback_calls = callback_calls.clone();
            hot.accept_deps(
                vec![dep_url.clone()],
                Some(Rc::new(move |_changed: Vec<Option<Value>>| {
                    callback_calls.set(callback_calls.get() + 1);
                    Ok(())
                })),
            );
            Ok(())
        }))
    };
    let mut main_decl = base_decl("main", main_body);
    main_decl.loaded_modules.push(LoadedModuleRequestEntry {
        request: request(dep_id, "dep"),
        bindings: vec![ImportBinding::Named { imported: "value".into(), local: "value".into() }],
    });
    app.load(main_id, Rc::new(main_decl), None);

    block_on(app.dispatch()).expect("initial dispatch links and evaluates");
    assert_eq!(main_calls.get(), 1);
    assert_eq!(callback_calls.get(), 0, "nothing accepted yet before any update");

    app.load(
        dep_id,
        Rc::new(base_decl("dep", counting_body(dep_calls.clone(), Some("value"), 2))),
        None,
    );

    let outcome = block_on(app.request_update());
    assert!(matches!(outcome, Some(UpdateOutcome::Success { .. })), "{outcome:?}");
    assert_eq!(dep_calls.get(), 2, "dep re-evaluates on its own change");
    assert_eq!(main_calls.get(), 1, "specific accept(dep, cb) never reruns the importer body");
    assert_eq!(callback_calls.get(), 1, "the registered accept callback actually ran");
}

#[test]
fn single_member_evaluate_failure_rolls_back() {
    let app = Rc::new(Application::new());
    let root_id = app.acquire("root");
    app.set_root(root_id);

    let root_calls = Rc::new(Cell::new(0u32));
    app.load(root_id, Rc::new(base_decl("root", self_accepting_body(root_calls.clone()))), None);
    block_on(app.dispatch()).expect("initial dispatch links and evaluates");
    assert_eq!(root_calls.get(), 1);

    let pre_update = app.controller(root_id).current().expect("evaluated instance from dispatch");

    let failing_body = Body::Sync(Rc::new(|_ctx: &ModuleContext, _exports: &ExportsHandle, _hot| {
        Err(HotError::Evaluation { url: Url::new("root"), message: "boom".into() })
    }));
    app.load(root_id, Rc::new(base_decl("root", failing_body)), None);

    let outcome = block_on(app.request_update());
    assert!(matches!(outcome, Some(UpdateOutcome::EvaluationError { .. })), "{outcome:?}");

    let post_update = app.controller(root_id).current().expect("current reverted, not cleared");
    assert!(
        Rc::ptr_eq(&pre_update, &post_update),
        "a throw in evaluate reverts current back to the pre-update instance"
    );
}

#[test]
fn multi_member_cyclic_scc_evaluate_failure_reverts_every_member() {
    let app = Rc::new(Application::new());
    let a_id = app.acquire("a");
    let b_id = app.acquire("b");
    let root_id = app.acquire("root");
    app.set_root(root_id);

    // `a` and `b` import each other, so they land in one SCC together.
    let a_calls = Rc::new(Cell::new(0u32));
    let mut a_decl_v1 = base_decl("a", counting_body(a_calls.clone(), None, 0));
    a_decl_v1.loaded_modules.push(LoadedModuleRequestEntry {
        request: request(b_id, "b"),
        bindings: Vec::new(),
    });
    app.load(a_id, Rc::new(a_decl_v1), None);

    let b_calls = Rc::new(Cell::new(0u32));
    let mut b_decl = base_decl("b", counting_body(b_calls.clone(), None, 0));
    b_decl.loaded_modules.push(LoadedModuleRequestEntry {
        request: request(a_id, "a"),
        bindings: Vec::new(),
    });
    app.load(b_id, Rc::new(b_decl), None);

    let root_calls = Rc::new(Cell::new(0u32));
    let mut root_decl = base_decl("root", self_accepting_body(root_calls.clone()));
    root_decl.loaded_modules.push(LoadedModuleRequestEntry {
        request: request(a_id, "a"),
        bindings: Vec::new(),
    });
    app.load(root_id, Rc::new(root_decl), None);

    block_on(app.dispatch()).expect("initial dispatch links and evaluates");
    assert_eq!(root_calls.get(), 1);

    let pre_a = app.controller(a_id).current().expect("a evaluated from dispatch");
    let pre_b = app.controller(b_id).current().expect("b evaluated from dispatch");

    // `a`'s new version keeps the same edge to `b` (still one SCC) but
    // throws during evaluate.
    let mut a_decl_v2 = base_decl(
        "a",
        Body::Sync(Rc::new(|_ctx: &ModuleContext, _exports: &ExportsHandle, _hot| {
            Err(HotError::Evaluation { url: Url::new("a"), message: "boom".into() })
        })),
    );
    a_decl_v2.loaded_modules.push(LoadedModuleRequestEntry {
        request: request(b_id, "b"),
        bindings: Vec::new(),
    });
    app.load(a_id, Rc::new(a_decl_v2), None);

    let outcome = block_on(app.request_update());
    assert!(matches!(outcome, Some(UpdateOutcome::EvaluationError { .. })), "{outcome:?}");

    let post_a = app.controller(a_id).current().expect("a's current reverted, not cleared");
    let post_b = app.controller(b_id).current().expect("b's current reverted, not cleared");
    assert!(Rc::ptr_eq(&pre_a, &post_a), "the thrower itself reverts to its pre-update instance");
    assert!(
        Rc::ptr_eq(&pre_b, &post_b),
        "its cycle-mate reverts too, even though it never threw: the SCC is one atomic unit"
    );
    assert_eq!(root_calls.get(), 1, "root never re-ran: the failed SCC never committed");
}
