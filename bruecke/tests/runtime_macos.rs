//! End-to-end tests against the live Objective-C runtime.

#![cfg(target_vendor = "apple")]

use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bruecke::{block, call_function, call_super, create_protocol_impl, define_class};
use bruecke::{handle, message, registry, subclass::ClassSpec, subclass::MethodSpec, sys};
use host::{CallbackQueue, HostFunction, Value};
use parking_lot::Mutex;

// Force CoreGraphics into the image list so dlsym can resolve its symbols.
#[link(name = "CoreGraphics", kind = "framework")]
extern "C" {}

extern "C" {
    fn objc_allocateProtocol(name: *const c_char) -> *mut c_void;
    fn objc_registerProtocol(proto: *mut c_void);
    fn protocol_addMethodDescription(
        proto: *mut c_void,
        name: sys::SEL,
        types: *const c_char,
        is_required: sys::BOOL,
        is_instance: sys::BOOL,
    );
}

fn class_value(name: &str) -> Value {
    handle::wrap_object(sys::lookup_class(name).expect("class lookup"))
}

fn nsstring(s: &str) -> Value {
    let class = sys::lookup_class("NSString").expect("NSString");
    let sel = sys::selector("stringWithUTF8String:").expect("selector");
    let cstr = CString::new(s).expect("utf8");
    let obj: sys::id = unsafe { sys::msg_send_1(class, sel, cstr.as_ptr()) };
    handle::wrap_object(obj)
}

fn string_of(value: &Value) -> String {
    let ptr = handle::object_ptr(value).expect("object");
    let sel = sys::selector("UTF8String").expect("selector");
    let utf8: *const c_char = unsafe { sys::msg_send_0(ptr, sel) };
    unsafe { CStr::from_ptr(utf8) }.to_string_lossy().into_owned()
}

#[test]
fn primitive_round_trip_through_send() {
    let number = message::send(
        &class_value("NSNumber"),
        "numberWithInteger:",
        &[Value::Number(42.0)],
    )
    .expect("numberWithInteger:");
    let back = message::send(&number, "integerValue", &[]).expect("integerValue");
    assert_eq!(back, Value::Number(42.0));
}

#[test]
fn struct_return_from_range_of_string() {
    let haystack = nsstring("hello");
    let range = message::send(&haystack, "rangeOfString:", &[nsstring("ll")])
        .expect("rangeOfString:");
    assert_eq!(range.get("location"), Some(&Value::Number(2.0)));
    assert_eq!(range.get("length"), Some(&Value::Number(2.0)));
}

#[test]
fn prepared_send_matches_send() {
    let value = nsstring("prepared");
    let plan = message::prepare(&value, "length").expect("prepare");
    let direct = message::send(&value, "length", &[]).expect("send");
    let prepared = message::send_prepared(&value, &plan, &[]).expect("send_prepared");
    assert_eq!(direct, prepared);
    assert_eq!(direct, Value::Number(8.0));
}

#[test]
fn responds_to_selector_queries() {
    let value = nsstring("x");
    assert!(message::responds_to_selector(&value, "length").expect("query"));
    assert!(!message::responds_to_selector(&value, "definitelyNotAMethod").expect("query"));
}

#[test]
fn selector_registration_is_idempotent() {
    let a = sys::selector("compare:options:").expect("selector");
    let b = sys::selector("compare:options:").expect("selector");
    assert_eq!(a, b);
}

#[test]
fn rect_intersection_through_c_function() {
    const RECT: &str = "{CGRect={CGPoint=dd}{CGSize=dd}}";
    let rect = |x: f64, y: f64, w: f64, h: f64| {
        Value::Object(vec![
            (
                "origin".into(),
                Value::Object(vec![
                    ("x".into(), Value::Number(x)),
                    ("y".into(), Value::Number(y)),
                ]),
            ),
            (
                "size".into(),
                Value::Object(vec![
                    ("width".into(), Value::Number(w)),
                    ("height".into(), Value::Number(h)),
                ]),
            ),
        ])
    };
    let result = call_function(
        "CGRectIntersectsRect",
        "B",
        &[RECT, RECT],
        None,
        &[rect(0.0, 0.0, 10.0, 10.0), rect(5.0, 5.0, 10.0, 10.0)],
    )
    .expect("CGRectIntersectsRect");
    assert_eq!(result, Value::Bool(true));
}

#[test]
fn retain_parity_for_wrapped_objects() {
    let class = sys::lookup_class("NSObject").expect("NSObject");
    let new_sel = sys::selector("new").expect("new");
    let object: sys::id = unsafe { sys::msg_send_0(class, new_sel) };

    let retain_count = |obj: sys::id| -> u64 {
        let sel = sys::selector("retainCount").expect("retainCount");
        unsafe { sys::msg_send_0(obj, sel) }
    };

    let before = retain_count(object);
    let wrapped = handle::wrap_object(object);
    assert_eq!(retain_count(object), before + 1);
    let clone = wrapped.clone();
    drop(wrapped);
    assert_eq!(retain_count(object), before + 1);
    drop(clone);
    assert_eq!(retain_count(object), before);

    sys::release(object);
}

#[test]
fn protocol_forwarding_squares_the_argument() {
    let _ = CallbackQueue::current();

    // Build the protocol at runtime: - (NSInteger)compute:(NSInteger)x;
    let proto_name = CString::new("BridgeComputing").expect("name");
    let compute = sys::selector("compute:").expect("selector");
    unsafe {
        let proto = objc_allocateProtocol(proto_name.as_ptr());
        if !proto.is_null() {
            let types = CString::new("q24@0:8q16").expect("types");
            protocol_addMethodDescription(proto, compute, types.as_ptr(), sys::YES, sys::YES);
            objc_registerProtocol(proto);
        }
    }

    let hits = Arc::new(AtomicUsize::new(0));
    let hits_cb = hits.clone();
    let square = HostFunction::new(1, move |args| {
        hits_cb.fetch_add(1, Ordering::SeqCst);
        let x = args[0].as_i64().expect("argument");
        Ok(Value::Number((x * x) as f64))
    });

    let instance = create_protocol_impl(
        "BridgeComputing",
        vec![("compute:".to_string(), square)],
        false,
    )
    .expect("protocol impl");

    let result = message::send(&instance, "compute:", &[Value::Number(7.0)])
        .expect("forwarded compute:");
    assert_eq!(result, Value::Number(49.0));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn dropping_the_handle_runs_dealloc_and_unregisters() {
    let _ = CallbackQueue::current();
    let noop = HostFunction::new(0, |_| Ok(Value::Undefined));
    let instance = create_protocol_impl(
        "NSObject", // every class conforms; NSObject protocol always exists
        vec![("description".to_string(), noop)],
        false,
    );
    // NSObject-the-protocol declares description
    let instance = instance.expect("protocol impl");
    let key = handle::pointer_value(&instance).expect("pointer");
    assert!(registry::protocols().contains(key));

    drop(instance);
    assert!(!registry::protocols().contains(key));
}

#[test]
fn cross_thread_block_appends_in_order() {
    let queue = CallbackQueue::current();
    let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    let push = HostFunction::new(1, move |args| {
        seen_cb.lock().push(args[0].as_i64().expect("argument"));
        Ok(Value::Undefined)
    });

    let heap_block = block::create_block(push, "@?<v@?q>").expect("block");

    // beamr-style: a block object's invoke pointer lives at offset 16
    #[repr(C)]
    struct BlockHeader {
        isa: *const c_void,
        flags: i32,
        reserved: i32,
        invoke: *const c_void,
    }
    let invoke: unsafe extern "C" fn(*const c_void, i64) =
        unsafe { std::mem::transmute((*(heap_block as *const BlockHeader)).invoke) };
    let block_addr = heap_block as usize;

    let worker = std::thread::spawn(move || {
        for i in [1i64, 2, 3] {
            unsafe { invoke(block_addr as *const c_void, i) };
        }
    });

    while seen.lock().len() < 3 {
        queue.drain_for(Duration::from_millis(5));
    }
    worker.join().expect("worker");
    assert_eq!(*seen.lock(), vec![1, 2, 3]);
}

#[test]
fn subclass_overrides_description_and_calls_super() {
    let _ = CallbackQueue::current();

    let super_calls = Arc::new(AtomicUsize::new(0));
    let super_calls_cb = super_calls.clone();
    let describe = HostFunction::new(1, move |args| {
        // args[0] is self
        super_calls_cb.fetch_add(1, Ordering::SeqCst);
        let inherited = call_super(&args[0], "description", &[])
            .map_err(|e| host::HostError::new(e.to_string()))?;
        Ok(nsstring(&format!("X{}", string_of(&inherited))))
    });

    let mut methods = std::collections::HashMap::new();
    methods.insert(
        "description".to_string(),
        MethodSpec {
            function: describe,
            types: None,
            is_class_method: false,
        },
    );
    let class = define_class(ClassSpec {
        name: "BridgeDescribed".to_string(),
        superclass: "NSObject".to_string(),
        protocols: Vec::new(),
        methods,
        cross_context: false,
    })
    .expect("define class");

    let instance = message::send(&class, "new", &[]).expect("new");
    let described = message::send(&instance, "description", &[]).expect("description");
    let text = string_of(&described);
    assert!(text.starts_with("X<BridgeDescribed"), "got '{}'", text);
    assert_eq!(super_calls.load(Ordering::SeqCst), 1);
}
