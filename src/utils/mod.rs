//! Small free-standing helpers with no other obvious home.

#[inline(never)]
pub fn spin_loop() -> ! {
    loop {
        ::core::hint::spin_loop();
    }
}
