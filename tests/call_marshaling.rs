//! End-to-end call marshaling: script values in, native frames through,
//! results back out.

use std::cell::Cell;
use std::rc::Rc;

use scriptbridge::class_desc::{DefaultValue, ParamCollection};
use scriptbridge::containers;
use scriptbridge::context::BridgeContext;
use scriptbridge::error::{BridgeError, Result};
use scriptbridge::host::dispatch::NativeFn;
use scriptbridge::host::object::ObjectId;
use scriptbridge::host::reflection::{
    ClassBuilder, FunctionBuilder, HostReflection, NativeKind,
};
use scriptbridge::script::coroutine::CoroutineStatus;
use scriptbridge::script::value::ScriptValue;

/// Builds a world with one reflected class and native function bodies.
/// `Actor` layout: Health f32 at offset 0; the bodies below rely on that.
fn world(wait_token: Rc<Cell<u64>>) -> BridgeContext {
    let mut refl = HostReflection::new();
    let vec3 = refl.register_class(
        ClassBuilder::strukt("Vec3")
            .field("X", NativeKind::Float)
            .field("Y", NativeKind::Float)
            .field("Z", NativeKind::Float),
    );
    let color = refl.register_enum(
        "EColor",
        vec![
            ("Red".to_string(), 0),
            ("Green".to_string(), 1),
            ("Blue".to_string(), 2),
        ],
    );
    let latent = refl.latent_struct();
    let actor = refl.register_class(
        ClassBuilder::class("Actor")
            .field("Health", NativeKind::Float)
            .field("Tag", NativeKind::Name)
            .field("Label", NativeKind::Str)
            .field("Position", NativeKind::Struct(vec3))
            .field("Color", NativeKind::Enum(color))
            .field("Scores", NativeKind::Array(Box::new(NativeKind::Int32)))
            .function(FunctionBuilder::new("GetHealth").returns(NativeKind::Float))
            .function(FunctionBuilder::new("SetHealth").param("NewHealth", NativeKind::Float))
            .function(
                FunctionBuilder::new("AddValues")
                    .param("A", NativeKind::Int32)
                    .param("B", NativeKind::Int32)
                    .returns(NativeKind::Int32),
            )
            .function(
                FunctionBuilder::new("Accumulate")
                    .out_param("Count", NativeKind::Int32)
                    .returns(NativeKind::Bool),
            )
            .function(
                FunctionBuilder::new("Wait")
                    .param("Duration", NativeKind::Float)
                    .param("LatentInfo", NativeKind::Struct(latent)),
            ),
    );
    refl.register_class(ClassBuilder::class("Item").field("Owner", NativeKind::Object(actor)));
    refl.register_class(
        ClassBuilder::class("ScriptActor")
            .extends("Actor")
            .generated()
            .field(
                "Score_3_0123456789ABCDEF0123456789ABCDEF",
                NativeKind::Int32,
            ),
    );

    let mut ctx = BridgeContext::new(refl);
    let find = |ctx: &BridgeContext, name: &str| {
        ctx.reflection().find_function(actor, name).unwrap()
    };

    let k = find(&ctx, "GetHealth");
    ctx.dispatch_mut().register_native(
        k,
        NativeFn::new(|ctx, target, frame| {
            let base = resolve(ctx, target)?;
            frame.write::<f32>(base.read::<f32>());
            Ok(())
        }),
    );
    let k = find(&ctx, "SetHealth");
    ctx.dispatch_mut().register_native(
        k,
        NativeFn::new(|ctx, target, frame| {
            let base = resolve(ctx, target)?;
            base.write::<f32>(frame.read::<f32>());
            Ok(())
        }),
    );
    let k = find(&ctx, "AddValues");
    ctx.dispatch_mut().register_native(
        k,
        NativeFn::new(|_, _, frame| {
            // A at 0, B at 4, ReturnValue at 8
            let sum = frame.read::<i32>() + frame.offset(4).read::<i32>();
            frame.offset(8).write::<i32>(sum);
            Ok(())
        }),
    );
    let k = find(&ctx, "Accumulate");
    ctx.dispatch_mut().register_native(
        k,
        NativeFn::new(|_, _, frame| {
            // Count at 0, ReturnValue at 4
            frame.write::<i32>(frame.read::<i32>() + 10);
            frame.offset(4).write::<bool>(true);
            Ok(())
        }),
    );
    let k = find(&ctx, "Wait");
    ctx.dispatch_mut().register_native(
        k,
        NativeFn::new(move |_, _, frame| {
            // Duration at 0, LatentInfo.Linkage at 8
            wait_token.set(frame.offset(8).read::<u64>());
            Ok(())
        }),
    );
    ctx
}

fn resolve(
    ctx: &BridgeContext,
    target: ObjectId,
) -> Result<scriptbridge::host::memory::ValuePtr> {
    ctx.heap()
        .resolve(target)
        .ok_or(BridgeError::StaleDescriptor { what: "object" })
}

/// Calls a method the way script would: resolve the field to a callable,
/// push the target and arguments, protected-call, collect the results.
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
fn scalar_round_trip() {
    let mut ctx = world(Rc::new(Cell::new(0)));
    let id = ctx.spawn_object("Actor").unwrap();

    let results = call_method(&mut ctx, id, "SetHealth", vec![ScriptValue::Float(42.5)]).unwrap();
    assert!(results.is_empty());
    let results = call_method(&mut ctx, id, "GetHealth", vec![]).unwrap();
    assert_eq!(results, vec![ScriptValue::Float(42.5)]);
    assert_eq!(ctx.runtime().stack.top(), 0);
}

#[test]
fn integer_arguments_and_return() {
    let mut ctx = world(Rc::new(Cell::new(0)));
    let id = ctx.spawn_object("Actor").unwrap();
    let results = call_method(
        &mut ctx,
        id,
        "AddValues",
        vec![ScriptValue::Int(2), ScriptValue::Int(3)],
    )
    .unwrap();
    assert_eq!(results, vec![ScriptValue::Int(5)]);
}

#[test]
fn out_parameter_comes_back_before_return_value() {
    let mut ctx = world(Rc::new(Cell::new(0)));
    let id = ctx.spawn_object("Actor").unwrap();
    let results = call_method(&mut ctx, id, "Accumulate", vec![ScriptValue::Int(4)]).unwrap();
    assert_eq!(results, vec![ScriptValue::Int(14), ScriptValue::Bool(true)]);
}

#[test]
fn rebinding_a_class_records_a_disambiguated_global() {
    let mut ctx = world(Rc::new(Cell::new(0)));
    let first = ctx.bind_class("Actor", "Game").unwrap();
    let second = ctx.bind_class("Actor", "Mods").unwrap();
    assert_eq!(first, second);
    // The first binding stays primary; the later module gets a shadow name.
    assert!(ctx.runtime().global("Actor").is_some());
    assert!(ctx.runtime().global("Mods_Actor").is_some());
    assert!(ctx.runtime().global("Game_Actor").is_none());
}

#[test]
fn missing_argument_uses_registered_default() {
    let mut ctx = world(Rc::new(Cell::new(0)));
    let cid = ctx.bind_class("Actor", "Game").unwrap();
    let mut defaults = ParamCollection::default();
    defaults.insert("NewHealth".to_string(), DefaultValue::Float(50.0));
    ctx.registry()
        .class(cid)
        .unwrap()
        .set_default_params("SetHealth", defaults);

    let id = ctx.spawn_object("Actor").unwrap();
    call_method(&mut ctx, id, "SetHealth", vec![]).unwrap();
    let results = call_method(&mut ctx, id, "GetHealth", vec![]).unwrap();
    assert_eq!(results, vec![ScriptValue::Float(50.0)]);
}

#[test]
fn mismatched_argument_degrades_to_default_value() {
    let mut ctx = world(Rc::new(Cell::new(0)));
    let id = ctx.spawn_object("Actor").unwrap();
    // A string is not a number; the call proceeds with the zero value.
    call_method(&mut ctx, id, "SetHealth", vec![ScriptValue::str("abc")]).unwrap();
    let results = call_method(&mut ctx, id, "GetHealth", vec![]).unwrap();
    assert_eq!(results, vec![ScriptValue::Float(0.0)]);
}

#[test]
fn string_and_name_fields() {
    let mut ctx = world(Rc::new(Cell::new(0)));
    let id = ctx.spawn_object("Actor").unwrap();

    ctx.object_set_field(id, "Label", &ScriptValue::str("Bob"))
        .unwrap();
    assert_eq!(
        ctx.object_get_field(id, "Label").unwrap(),
        ScriptValue::str("Bob")
    );

    ctx.object_set_field(id, "Tag", &ScriptValue::str("Boss"))
        .unwrap();
    assert_eq!(
        ctx.object_get_field(id, "Tag").unwrap(),
        ScriptValue::str("Boss")
    );
}

#[test]
fn enum_field_accepts_entry_name_and_raw_value() {
    let mut ctx = world(Rc::new(Cell::new(0)));
    let id = ctx.spawn_object("Actor").unwrap();

    ctx.object_set_field(id, "Color", &ScriptValue::str("Green"))
        .unwrap();
    assert_eq!(
        ctx.object_get_field(id, "Color").unwrap(),
        ScriptValue::Int(1)
    );

    ctx.object_set_field(id, "Color", &ScriptValue::Int(2))
        .unwrap();
    assert_eq!(
        ctx.object_get_field(id, "Color").unwrap(),
        ScriptValue::Int(2)
    );

    assert!(
        ctx.object_set_field(id, "Color", &ScriptValue::str("Purple"))
            .is_err()
    );
}

#[test]
fn struct_field_reads_as_independent_copy() {
    let mut ctx = world(Rc::new(Cell::new(0)));
    let id = ctx.spawn_object("Actor").unwrap();

    let copy = ctx.object_get_field(id, "Position").unwrap();
    let ud = copy.as_userdata().unwrap().as_struct().unwrap().clone();
    // Mutating the copy leaves the object untouched until written back.
    ud.ptr().write::<f32>(1.5);
    let fresh = ctx.object_get_field(id, "Position").unwrap();
    assert_eq!(
        fresh.as_userdata().unwrap().as_struct().unwrap().ptr().read::<f32>(),
        0.0
    );

    ctx.object_set_field(id, "Position", &copy).unwrap();
    let fresh = ctx.object_get_field(id, "Position").unwrap();
    assert_eq!(
        fresh.as_userdata().unwrap().as_struct().unwrap().ptr().read::<f32>(),
        1.5
    );
}

#[test]
fn object_field_goes_nil_when_target_dies() {
    let mut ctx = world(Rc::new(Cell::new(0)));
    let actor = ctx.spawn_object("Actor").unwrap();
    let item = ctx.spawn_object("Item").unwrap();

    let handle = ctx.wrap_object(actor);
    ctx.object_set_field(item, "Owner", &ScriptValue::Userdata(handle))
        .unwrap();
    let owner = ctx.object_get_field(item, "Owner").unwrap();
    assert_eq!(owner.as_userdata().unwrap().object_id(), Some(actor));

    ctx.destroy_object(actor);
    assert!(ctx.object_get_field(item, "Owner").unwrap().is_nil());
    // The old handle nulled out too.
    assert_eq!(owner.as_userdata().unwrap().object_id(), None);
}

#[test]
fn array_field_operations() {
    let mut ctx = world(Rc::new(Cell::new(0)));
    let id = ctx.spawn_object("Actor").unwrap();

    let value = ctx.object_get_field(id, "Scores").unwrap();
    let c = value.as_userdata().unwrap().as_container().unwrap().clone();

    assert_eq!(containers::array_add(&mut ctx, &c, &ScriptValue::Int(7)).unwrap(), 1);
    assert_eq!(containers::array_add(&mut ctx, &c, &ScriptValue::Int(9)).unwrap(), 2);
    assert_eq!(containers::array_num(&c).unwrap(), 2);
    assert_eq!(
        containers::array_get(&mut ctx, &c, 2).unwrap(),
        ScriptValue::Int(9)
    );
    assert_eq!(
        containers::array_find(&mut ctx, &c, &ScriptValue::Int(9)).unwrap(),
        2
    );
    assert_eq!(
        containers::array_find(&mut ctx, &c, &ScriptValue::Int(100)).unwrap(),
        0
    );

    containers::array_set(&mut ctx, &c, 1, &ScriptValue::Int(5)).unwrap();
    containers::array_remove(&mut ctx, &c, 1).unwrap();
    assert_eq!(containers::array_num(&c).unwrap(), 1);
    assert_eq!(
        containers::array_get(&mut ctx, &c, 1).unwrap(),
        ScriptValue::Int(9)
    );
    containers::array_clear(&mut ctx, &c).unwrap();
    assert_eq!(containers::array_num(&c).unwrap(), 0);

    // Same handle comes back for the same field.
    let again = ctx.object_get_field(id, "Scores").unwrap();
    assert_eq!(value.as_userdata(), again.as_userdata());

    // Destroying the owner invalidates the view instead of dangling.
    ctx.destroy_object(id);
    assert!(matches!(
        containers::array_num(&c),
        Err(BridgeError::StaleDescriptor { what: "container" })
    ));
}

#[test]
fn generated_field_resolves_by_display_name() {
    let mut ctx = world(Rc::new(Cell::new(0)));
    let id = ctx.spawn_object("ScriptActor").unwrap();

    ctx.object_set_field(id, "Score", &ScriptValue::Int(42))
        .unwrap();
    assert_eq!(
        ctx.object_get_field(id, "Score").unwrap(),
        ScriptValue::Int(42)
    );
    // Inherited fields still resolve through the generated subclass.
    ctx.object_set_field(id, "Health", &ScriptValue::Float(3.0))
        .unwrap();
    assert_eq!(
        ctx.object_get_field(id, "Health").unwrap(),
        ScriptValue::Float(3.0)
    );
}

#[test]
fn unknown_field_is_an_error() {
    let mut ctx = world(Rc::new(Cell::new(0)));
    let id = ctx.spawn_object("Actor").unwrap();
    assert!(matches!(
        ctx.object_get_field(id, "NoSuchField"),
        Err(BridgeError::UnknownFunction { .. })
    ));
}

#[test]
fn latent_call_suspends_coroutine_until_completion() {
    let token = Rc::new(Cell::new(u64::MAX));
    let mut ctx = world(Rc::clone(&token));
    let id = ctx.spawn_object("Actor").unwrap();

    let resumed = Rc::new(Cell::new(false));
    let resumed_in_body = Rc::clone(&resumed);
    let resume = ctx.runtime_mut().make_function(move |_| {
        resumed_in_body.set(true);
        Ok(0)
    });
    let body = ctx.runtime_mut().make_function(move |ctx| {
        let ScriptValue::Function(f) = ctx
            .object_get_field(id, "Wait")
            .map_err(|e| scriptbridge::error::ScriptError::runtime(e.to_string()))?
        else {
            return Err(scriptbridge::error::ScriptError::runtime("not callable"));
        };
        let handle = ctx.wrap_object(id);
        ctx.runtime_mut().stack.push(ScriptValue::Userdata(handle));
        ctx.runtime_mut().stack.push(ScriptValue::Float(1.5));
        ctx.pcall(&f, 2)
            .map_err(|e| scriptbridge::error::ScriptError::runtime(e.to_string()))
    });

    let co = ctx.run_coroutine(body, Some(resume), 0).unwrap();
    assert_eq!(ctx.runtime().coroutines.status(co), CoroutineStatus::Suspended);
    assert_ne!(token.get(), u64::MAX);
    assert!(!resumed.get());

    ctx.complete_latent(token.get()).unwrap();
    assert!(resumed.get());
    assert_eq!(ctx.runtime().coroutines.status(co), CoroutineStatus::Dead);
    assert_eq!(ctx.runtime().coroutines.pending_count(), 0);
}

#[test]
fn latent_call_outside_coroutine_fails() {
    let mut ctx = world(Rc::new(Cell::new(0)));
    let id = ctx.spawn_object("Actor").unwrap();
    assert!(call_method(&mut ctx, id, "Wait", vec![ScriptValue::Float(1.0)]).is_err());
}
