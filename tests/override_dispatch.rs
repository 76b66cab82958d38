//! Script overrides of native functions: redirection, preserved originals,
//! inherited duplication, and descriptor lifetime around calls.

use std::cell::Cell;
use std::rc::Rc;

use scriptbridge::context::BridgeContext;
use scriptbridge::error::{BridgeError, Result};
use scriptbridge::host::dispatch::NativeFn;
use scriptbridge::host::memory::ParamBuffer;
use scriptbridge::host::object::ObjectId;
use scriptbridge::host::reflection::{
    ClassBuilder, FuncFlags, FunctionBuilder, HostReflection, NativeKind, PropFlags, TypeKey,
};
use scriptbridge::script::value::ScriptValue;

/// `Actor` layout: Health f32 at offset 0, Armor i32 at offset 4.
fn world() -> BridgeContext {
    let mut refl = HostReflection::new();
    let actor = refl.register_class(
        ClassBuilder::class("Actor")
            .field("Health", NativeKind::Float)
            .field_with_flags("Armor", NativeKind::Int32, PropFlags::REP_NOTIFY)
            .function(
                FunctionBuilder::new("OnHit")
                    .flags(FuncFlags::NATIVE | FuncFlags::EVENT)
                    .param("Damage", NativeKind::Float),
            )
            .function(
                FunctionBuilder::new("GetHealth")
                    .flags(FuncFlags::NATIVE | FuncFlags::EVENT)
                    .returns(NativeKind::Float),
            )
            .function(FunctionBuilder::new("OnRep_Armor"))
            .function(FunctionBuilder::new("GetName").returns(NativeKind::Str)),
    );
    refl.register_class(
        ClassBuilder::class("Pawn")
            .extends("Actor")
            .function(FunctionBuilder::new("SelfDestruct")),
    );

    let mut ctx = BridgeContext::new(refl);
    let on_hit = ctx.reflection().find_function(actor, "OnHit").unwrap();
    ctx.dispatch_mut().register_native(
        on_hit,
        NativeFn::new(|ctx, target, frame| {
            let base = body_of(ctx, target)?;
            base.write::<f32>(base.read::<f32>() + frame.read::<f32>());
            Ok(())
        }),
    );
    let get_health = ctx.reflection().find_function(actor, "GetHealth").unwrap();
    ctx.dispatch_mut().register_native(
        get_health,
        NativeFn::new(|ctx, target, frame| {
            frame.write::<f32>(body_of(ctx, target)?.read::<f32>());
            Ok(())
        }),
    );
    ctx
}

fn body_of(ctx: &BridgeContext, id: ObjectId) -> Result<scriptbridge::host::memory::ValuePtr> {
    ctx.heap()
        .resolve(id)
        .ok_or(BridgeError::StaleDescriptor { what: "object" })
}

fn actor_key(ctx: &BridgeContext) -> TypeKey {
    ctx.reflection().class_by_name("Actor").unwrap().key
}

fn pawn_key(ctx: &BridgeContext) -> TypeKey {
    ctx.reflection().class_by_name("Pawn").unwrap().key
}

fn call_method(
    ctx: &mut BridgeContext,
    id: ObjectId,
    name: &str,
    args: Vec<ScriptValue>,
) -> Result<Vec<ScriptValue>> {
    let ScriptValue::Function(f) = ctx.object_get_field(id, name)? else {
        panic!("'{name}' did not resolve to a function");
    };
    let handle = ctx.wrap_object(id);
    ctx.runtime_mut().stack.push(ScriptValue::Userdata(handle));
    let nargs = args.len() + 1;
    for arg in args {
        ctx.runtime_mut().stack.push(arg);
    }
    let nresults = ctx.pcall(&f, nargs)?;
    let mut out = Vec::with_capacity(nresults);
    for _ in 0..nresults {
        out.push(ctx.runtime_mut().stack.pop_value().unwrap());
    }
    out.reverse();
    Ok(out)
}

#[test]
fn native_dispatch_reaches_script_override() {
    let mut ctx = world();
    let id = ctx.spawn_object("Actor").unwrap();

    let seen = Rc::new(Cell::new(-1.0f64));
    let seen_in_cb = Rc::clone(&seen);
    let cb = ctx.runtime_mut().make_function(move |ctx| {
        // Argument 1 is the target handle, 2 the first parameter.
        let damage = ctx
            .runtime()
            .frame_arg(2)
            .and_then(|v| v.as_float())
            .unwrap_or(-2.0);
        seen_in_cb.set(damage);
        Ok(0)
    });
    let class = actor_key(&ctx);
    let key = ctx.override_function(class, "OnHit", cb).unwrap();
    assert!(ctx.dispatch().is_redirected(key));

    let frame = ParamBuffer::zeroed(4, 4);
    frame.ptr().write::<f32>(42.5);
    ctx.invoke_function_key(key, id, frame.ptr()).unwrap();
    assert_eq!(seen.get(), 42.5);

    // The native body never ran.
    let results = call_method(&mut ctx, id, "GetHealth", vec![]).unwrap();
    assert_eq!(results, vec![ScriptValue::Float(0.0)]);
}

#[test]
fn script_call_of_overridden_function_runs_preserved_original() {
    let mut ctx = world();
    let id = ctx.spawn_object("Actor").unwrap();

    let fired = Rc::new(Cell::new(false));
    let fired_in_cb = Rc::clone(&fired);
    let cb = ctx.runtime_mut().make_function(move |_| {
        fired_in_cb.set(true);
        Ok(0)
    });
    let class = actor_key(&ctx);
    ctx.override_function(class, "OnHit", cb).unwrap();

    call_method(&mut ctx, id, "OnHit", vec![ScriptValue::Float(10.0)]).unwrap();
    let results = call_method(&mut ctx, id, "GetHealth", vec![]).unwrap();
    assert_eq!(results, vec![ScriptValue::Float(10.0)]);
    assert!(!fired.get());
}

#[test]
fn inherited_override_duplicates_onto_subclass() {
    let mut ctx = world();
    let id = ctx.spawn_object("Pawn").unwrap();
    let actor = actor_key(&ctx);
    let pawn = pawn_key(&ctx);
    let template = ctx.reflection().find_function(actor, "OnHit").unwrap();

    let seen = Rc::new(Cell::new(-1.0f64));
    let seen_in_cb = Rc::clone(&seen);
    let cb = ctx.runtime_mut().make_function(move |ctx| {
        let damage = ctx
            .runtime()
            .frame_arg(2)
            .and_then(|v| v.as_float())
            .unwrap_or(-2.0);
        seen_in_cb.set(damage);
        Ok(0)
    });
    let dup = ctx.override_function(pawn, "OnHit", cb).unwrap();
    assert_ne!(dup, template);
    assert_eq!(ctx.reflection().find_function(pawn, "OnHit"), Some(dup));
    assert!(ctx.overrides().record(dup).is_some_and(|r| r.duplicated));
    // The template keeps its native body for other classes.
    assert!(!ctx.dispatch().is_redirected(template));

    let frame = ParamBuffer::zeroed(4, 4);
    frame.ptr().write::<f32>(7.5);
    ctx.invoke_function_key(dup, id, frame.ptr()).unwrap();
    assert_eq!(seen.get(), 7.5);

    // Script calls through the duplicate still run the template's body.
    call_method(&mut ctx, id, "OnHit", vec![ScriptValue::Float(5.0)]).unwrap();
    let results = call_method(&mut ctx, id, "GetHealth", vec![]).unwrap();
    assert_eq!(results, vec![ScriptValue::Float(5.0)]);
}

#[test]
fn restore_returns_dispatch_to_native() {
    let mut ctx = world();
    let id = ctx.spawn_object("Actor").unwrap();

    let cb = ctx.runtime_mut().make_function(|_| Ok(0));
    let class = actor_key(&ctx);
    let key = ctx.override_function(class, "OnHit", cb).unwrap();
    assert!(ctx.restore_override(key));
    assert!(!ctx.dispatch().is_redirected(key));
    assert_eq!(ctx.runtime().pinned_count(), 0);
    assert!(ctx.overrides().record(key).is_none());

    let frame = ParamBuffer::zeroed(4, 4);
    frame.ptr().write::<f32>(3.0);
    ctx.invoke_function_key(key, id, frame.ptr()).unwrap();
    let results = call_method(&mut ctx, id, "GetHealth", vec![]).unwrap();
    assert_eq!(results, vec![ScriptValue::Float(3.0)]);

    assert!(!ctx.restore_override(key));
}

#[test]
fn plain_native_function_is_not_overridable() {
    let mut ctx = world();
    let cb = ctx.runtime_mut().make_function(|_| Ok(0));
    let class = actor_key(&ctx);
    assert!(matches!(
        ctx.override_function(class, "GetName", cb),
        Err(BridgeError::NotOverridable { .. })
    ));
    assert_eq!(ctx.runtime().pinned_count(), 0);
}

#[test]
fn rep_notify_handler_is_overridable() {
    let mut ctx = world();
    let cb = ctx.runtime_mut().make_function(|_| Ok(0));
    let class = actor_key(&ctx);
    assert!(ctx.override_function(class, "OnRep_Armor", cb).is_ok());
}

#[test]
fn class_descriptors_follow_object_lifetime() {
    let mut ctx = world();
    let id = ctx.spawn_object("Pawn").unwrap();
    assert!(ctx.registry().find_class("Pawn").is_some());
    assert!(ctx.registry().find_class("Actor").is_some());

    assert!(ctx.destroy_object(id));
    assert!(ctx.registry().find_class("Pawn").is_none());
    assert!(ctx.registry().find_class("Actor").is_none());
}

#[test]
fn release_during_reentrant_call_is_deferred() {
    let mut ctx = world();
    let id = ctx.spawn_object("Pawn").unwrap();
    let pawn = pawn_key(&ctx);
    let key = ctx.reflection().find_function(pawn, "SelfDestruct").unwrap();

    let still_registered = Rc::new(Cell::new(false));
    let probe = Rc::clone(&still_registered);
    ctx.dispatch_mut().register_native(
        key,
        NativeFn::new(move |ctx, target, _| {
            ctx.destroy_object(target);
            // The in-flight call parks the release until we return.
            probe.set(ctx.registry().find_class("Pawn").is_some());
            Ok(())
        }),
    );

    // Resolving the field creates the function descriptor.
    ctx.object_get_field(id, "SelfDestruct").unwrap();
    let desc_id = ctx.registry().find_function_desc(key).unwrap();

    let handle = ctx.wrap_object(id);
    ctx.runtime_mut().stack.push(ScriptValue::Userdata(handle));
    ctx.call_function(desc_id, 1).unwrap();

    assert!(still_registered.get());
    assert!(ctx.registry().find_class("Pawn").is_none());
    assert!(ctx.registry().find_class("Actor").is_none());
    assert_eq!(ctx.runtime().stack.top(), 0);
}
