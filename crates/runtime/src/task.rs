//! Detached tasks, job queue, and the quiescence primitive.
//!
//! `Spawn` creates detached OS threads; the JIT session and the process
//! teardown path call `hc_task_wait_all` so every spawned task finishes
//! while its code is still mapped.

use std::collections::HashMap;
use std::os::raw::{c_char, c_void};
use std::sync::Mutex;
use std::thread::JoinHandle;

type TaskFn = extern "C" fn(i64) -> i64;

static TASKS: Mutex<Vec<JoinHandle<()>>> = Mutex::new(Vec::new());
static JOBS: Mutex<Option<HashMap<i64, JoinHandle<i64>>>> = Mutex::new(None);
static NEXT_ID: Mutex<i64> = Mutex::new(1);

fn next_id() -> i64 {
    let mut id = NEXT_ID.lock().unwrap();
    let v = *id;
    *id += 1;
    v
}

/// Spawn a detached HolyC task. Returns a task id.
///
/// # Safety
/// `fp` must be a valid `extern "C" fn(i64) -> i64` code pointer that
/// stays mapped until `hc_task_wait_all` returns.
#[no_mangle]
pub unsafe extern "C" fn Spawn(fp: *mut c_void, arg: i64, _name: *const c_char) -> i64 {
    if fp.is_null() {
        return 0;
    }
    let f: TaskFn = std::mem::transmute(fp);
    let id = next_id();
    let handle = std::thread::spawn(move || {
        f(arg);
    });
    TASKS.lock().unwrap().push(handle);
    id
}

/// C-named alias used by the emitter's fixed symbol set.
///
/// # Safety
/// Same contract as [`Spawn`].
#[no_mangle]
pub unsafe extern "C" fn hc_task_spawn(fp: *mut c_void, arg: i64, name: *const c_char) -> i64 {
    Spawn(fp, arg, name)
}

/// Queue a job whose result is fetched with `JobResGet`.
///
/// # Safety
/// Same code-pointer contract as [`Spawn`].
#[no_mangle]
pub unsafe extern "C" fn JobQue(fp: *mut c_void, arg: i64) -> i64 {
    if fp.is_null() {
        return 0;
    }
    let f: TaskFn = std::mem::transmute(fp);
    let id = next_id();
    let handle = std::thread::spawn(move || f(arg));
    JOBS.lock().unwrap().get_or_insert_with(HashMap::new).insert(id, handle);
    id
}

/// Join a queued job and return its result (0 for unknown ids).
#[no_mangle]
pub extern "C" fn JobResGet(job: i64) -> i64 {
    let handle = JOBS.lock().unwrap().get_or_insert_with(HashMap::new).remove(&job);
    match handle {
        Some(h) => h.join().unwrap_or(0),
        None => 0,
    }
}

/// Run a function on a thread with a larger stack and wait for it.
///
/// # Safety
/// Same code-pointer contract as [`Spawn`].
#[no_mangle]
pub unsafe extern "C" fn CallStkGrow(stk_size: i64, fp: *mut c_void, arg: i64) -> i64 {
    if fp.is_null() {
        return 0;
    }
    let f: TaskFn = std::mem::transmute(fp);
    let size = (stk_size.max(64 * 1024)) as usize;
    std::thread::Builder::new()
        .stack_size(size)
        .spawn(move || f(arg))
        .map(|h| h.join().unwrap_or(0))
        .unwrap_or(0)
}

/// Block until every spawned task and unclaimed job has finished.
#[no_mangle]
pub extern "C" fn hc_task_wait_all() {
    loop {
        let handle = TASKS.lock().unwrap().pop();
        match handle {
            Some(h) => {
                let _ = h.join();
            }
            None => break,
        }
    }
    let jobs: Vec<JoinHandle<i64>> = JOBS
        .lock()
        .unwrap()
        .get_or_insert_with(HashMap::new)
        .drain()
        .map(|(_, h)| h)
        .collect();
    for h in jobs {
        let _ = h.join();
    }
}

/// Read one key (byte) from stdin; 0 at EOF.
#[no_mangle]
pub extern "C" fn PressAKey() -> i64 {
    let mut byte = 0u8;
    let n = unsafe { libc::read(0, &mut byte as *mut u8 as *mut c_void, 1) };
    if n == 1 {
        byte as i64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::{AtomicI64, Ordering};

    static COUNTER: AtomicI64 = AtomicI64::new(0);

    extern "C" fn bump(arg: i64) -> i64 {
        COUNTER.fetch_add(arg, Ordering::SeqCst);
        arg * 2
    }

    #[test]
    #[serial]
    fn test_spawn_and_wait_all() {
        COUNTER.store(0, Ordering::SeqCst);
        unsafe {
            Spawn(bump as *mut c_void, 3, std::ptr::null());
            Spawn(bump as *mut c_void, 4, std::ptr::null());
        }
        hc_task_wait_all();
        assert_eq!(COUNTER.load(Ordering::SeqCst), 7);
    }

    #[test]
    #[serial]
    fn test_job_queue_result() {
        let id = unsafe { JobQue(bump as *mut c_void, 21) };
        assert_eq!(JobResGet(id), 42);
        assert_eq!(JobResGet(9999), 0);
    }

    #[test]
    #[serial]
    fn test_call_stk_grow() {
        let r = unsafe { CallStkGrow(1 << 20, bump as *mut c_void, 5) };
        assert_eq!(r, 10);
    }
}
