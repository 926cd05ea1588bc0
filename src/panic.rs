fn abort_impl() -> ! {
    crate::utils::spin_loop()
}

#[cfg(not(test))]
#[panic_handler]
fn panic_handler(_info: &core::panic::PanicInfo<'_>) -> ! {
    abort_impl()
}
