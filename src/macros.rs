// (c) Copyright 2025 Helsing GmbH. All rights reserved.
/// Convenience macro for creating an object [`Value`](crate::Value) that represents a record.
///
/// ```rust
/// # use optimist::record;
/// let todo = record! {
///     "id" => 1,
///     "title" => "Buy milk",
///     "tags" => ["errand", "food"],
///     "owner" => { "name" => "Ada" }
/// };
/// assert_eq!(todo.get_field("title").unwrap(), "Buy milk");
/// ```
///
/// Values are single token trees. Wrap anything longer, such as negative numbers or method
/// calls, in parentheses: `"delta" => (-1)`.
#[macro_export]
macro_rules! record {
   ($($k:literal => $v:tt),* $(,)?) => {
        $crate::value!( { $( $k => $v ),* } )
    };
}

/// Convenience macro for creating any [`Value`](crate::Value).
///
/// Object literal (note the '{' and '}'):
/// ```rust
/// # use optimist::value;
/// let v = value!({ "a" => 1 });
/// ```
///
/// Array literal:
/// ```rust
/// # use optimist::value;
/// let v = value!([1, 2, { "nested" => true }]);
/// ```
///
/// `null`, and anything convertible with `Value::from`:
/// ```rust
/// # use optimist::{value, Value};
/// assert_eq!(value!(null), Value::Null);
/// assert_eq!(value!("x"), Value::from("x"));
/// ```
#[macro_export]
macro_rules! value {
    (null) => {
        $crate::Value::Null
    };

    ({ $($k:literal => $v:tt),* $(,)? }) => {{
        #[allow(unused_mut)]
        let mut fields = ::std::collections::BTreeMap::<::std::string::String, $crate::Value>::new();
        $(
            fields.insert(::std::string::String::from($k), $crate::value!($v));
        )*
        $crate::Value::Object(fields)
    }};

    ([ $($v:tt),* $(,)? ]) => {
        $crate::Value::Array(::std::vec![ $( $crate::value!($v) ),* ])
    };

    ($v:expr) => {
        $crate::Value::from($v)
    };
}
