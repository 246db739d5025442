extern crate alloc;
extern crate std;

use core::{
    alloc::Layout,
    cell::{Cell, RefCell},
    ffi::c_void,
};

use alloc::{string::String, vec::Vec};
use platform_abstraction_layer::Pal;

/// A [`Pal`] for tests: allocates from the std allocator while keeping track of
/// the live allocations, and panics instead of exiting so that fatal paths can
/// be tested with `#[should_panic]`.
#[derive(Default)]
pub struct TestPlatform {
    live: RefCell<Vec<(usize, Layout)>>,
    fail_next_malloc: Cell<bool>,
    last_message: RefCell<String>,
}

impl TestPlatform {
    pub fn new() -> TestPlatform {
        TestPlatform::default()
    }

    /// The amount of allocations made and not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.live.borrow().len()
    }

    /// Makes the next [`Pal::malloc`] return null, as if the heap was empty.
    pub fn fail_next_malloc(&self) {
        self.fail_next_malloc.set(true);
    }

    fn take_layout(&self, ptr: *mut c_void) -> Layout {
        let mut live = self.live.borrow_mut();
        let Some(index) = live.iter().position(|(p, _)| *p == ptr as usize) else {
            panic!("TestPlatform was passed a pointer it did not allocate: {ptr:?}");
        };
        live.swap_remove(index).1
    }
}

impl Pal for TestPlatform {
    fn malloc(&self, size: usize, align: usize) -> *mut c_void {
        if self.fail_next_malloc.replace(false) {
            return core::ptr::null_mut();
        }
        let layout = Layout::from_size_align(size, align).unwrap();
        // Safety: the RawHeap never asks for zero bytes.
        let ptr = unsafe { std::alloc::alloc(layout) };
        assert!(!ptr.is_null(), "the test machine is out of memory");
        self.live.borrow_mut().push((ptr as usize, layout));
        ptr as *mut c_void
    }

    unsafe fn realloc(&self, ptr: *mut c_void, new_size: usize) -> *mut c_void {
        let layout = self.take_layout(ptr);
        // Safety: the layout is the one `ptr` was allocated with.
        let new_ptr = unsafe { std::alloc::realloc(ptr as *mut u8, layout, new_size) };
        assert!(!new_ptr.is_null(), "the test machine is out of memory");
        let new_layout = Layout::from_size_align(new_size, layout.align()).unwrap();
        self.live.borrow_mut().push((new_ptr as usize, new_layout));
        new_ptr as *mut c_void
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        let layout = self.take_layout(ptr);
        // Safety: the layout is the one `ptr` was allocated with, and
        // take_layout makes sure it's only freed once.
        unsafe { std::alloc::dealloc(ptr as *mut u8, layout) };
    }

    fn println(&self, message: &str) {
        *self.last_message.borrow_mut() = String::from(message);
    }

    fn exit(&self, clean: bool) -> ! {
        let message = self.last_message.borrow().clone();
        panic!("TestPlatform::exit({clean}) was called after: {message}");
    }
}
