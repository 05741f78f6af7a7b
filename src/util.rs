/// Allocates a `len`-element vector without zeroing it. Callers must fully
/// overwrite the returned buffer before reading from it.
#[inline]
pub fn allocate_vec<T>(len: usize) -> Vec<T> {
    let mut ret = Vec::with_capacity(len);
    unsafe {
        ret.set_len(len);
    }
    ret
}
