use std::{
    fmt::{Debug, Display},
    str::FromStr,
};

use proptest::{
    arbitrary::{any, Arbitrary},
    prop_assert_eq, proptest,
    strategy::Strategy,
    test_runner::Config,
};
use serde::{de::DeserializeOwned, Serialize};

/// Quickly create a JSON string roundtrip proptest. Useful for simple data
/// types that map to/from a single base JSON type (string, int, ..).
///
/// ```ignore
/// json_string_roundtrip_proptest::<ScriptHash>();
/// ```
pub fn json_string_roundtrip_proptest<T>()
where
    T: Arbitrary + PartialEq + Serialize + DeserializeOwned,
{
    json_string_custom(any::<T>(), Config::default());
}

/// Create a JSON string roundtrip proptest using a custom strategy and
/// custom proptest [`Config`]. Useful for foreign types for which we cannot
/// implement [`Arbitrary`], or for reducing the number of iterations on
/// proptests that would otherwise take too long.
pub fn json_string_custom<S, T>(strategy: S, config: Config)
where
    S: Strategy<Value = T>,
    T: PartialEq + Serialize + DeserializeOwned + Debug,
{
    proptest!(config, |(value1 in strategy)| {
        let json1 = serde_json::to_string(&value1).unwrap();
        let value2 = serde_json::from_str::<T>(&json1).unwrap();
        let json2 = serde_json::to_string(&value2).unwrap();

        prop_assert_eq!(&value1, &value2);
        prop_assert_eq!(&json1, &json2);
    });
}

/// Quickly create a [`FromStr`] / [`Display`] roundtrip proptest.
pub fn fromstr_display_roundtrip_proptest<T>()
where
    T: Arbitrary + PartialEq + FromStr + Display,
    <T as FromStr>::Err: Debug,
{
    fromstr_display_custom(any::<T>(), Config::default());
}

/// [`FromStr`] / [`Display`] roundtrip with a custom strategy and config.
pub fn fromstr_display_custom<S, T>(strategy: S, config: Config)
where
    S: Strategy<Value = T>,
    T: PartialEq + FromStr + Display + Debug,
    <T as FromStr>::Err: Debug,
{
    proptest!(config, |(value1 in strategy)| {
        let string1 = value1.to_string();
        let value2 = T::from_str(&string1).unwrap();
        let string2 = value2.to_string();

        prop_assert_eq!(&value1, &value2);
        prop_assert_eq!(&string1, &string2);
    });
}
