#[macro_export]
macro_rules! trace(
    ( $($thing:expr),* ) => {
        if cfg!(any(test, feature = "trace")) { println! { $($thing),* } }
    };
);
