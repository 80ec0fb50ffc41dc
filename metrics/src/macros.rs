/// Construct a metric, register it with the registry and bind it to a local of the same name.
///
/// ```ignore
/// register!(links_seen, "Number of links observed", Counter::default(), sub_registry);
/// ```
#[macro_export]
macro_rules! register {
    ($name:ident, $help:expr, $metric:expr, $registry:expr) => {
        let $name = $metric;
        $registry.register(stringify!($name), $help, $name.clone());
    };
}
