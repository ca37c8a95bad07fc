//! Contains the macros used to declare the statistics of each service


/// Declares a struct of named, wrapping `u32` counters
///
/// Every counter becomes a public field. The struct also gets the list of
/// counter names and a way to visit every counter, so the values can be
/// exposed without knowing the concrete type.
///
/// # Example
///
/// ``` rust
/// uwb_core::stats! {
///     /// Counters of an imaginary service
///     pub struct ExampleStats {
///         request,
///         timeout,
///     }
/// }
///
/// let mut stats = ExampleStats::default();
/// uwb_core::stat_inc!(stats, timeout);
///
/// assert_eq!(ExampleStats::NAMES, &["request", "timeout"]);
/// assert_eq!(stats.get("timeout"), Some(1));
/// ```
#[macro_export]
macro_rules! stats {
    (
        $(#[$attr:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_attr:meta])*
                $field:ident,
            )*
        }
    ) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        $vis struct $name {
            $(
                $(#[$field_attr])*
                #[allow(missing_docs)]
                pub $field: u32,
            )*
        }

        impl $name {
            /// The names of all counters, in declaration order
            pub const NAMES: &'static [&'static str] = &[$(stringify!($field)),*];

            /// Calls `f` with the name and value of every counter
            pub fn for_each<F>(&self, mut f: F)
                where F: FnMut(&'static str, u32)
            {
                $(
                    f(stringify!($field), self.$field);
                )*
            }

            /// Returns the value of the counter called `name`
            pub fn get(&self, name: &str) -> Option<u32> {
                match name {
                    $(
                        stringify!($field) => Some(self.$field),
                    )*
                    _ => None,
                }
            }

            /// Sets every counter back to zero
            pub fn clear(&mut self) {
                *self = Self::default();
            }
        }
    };
}

/// Increments a counter declared with [`stats!`], wrapping on overflow
#[macro_export]
macro_rules! stat_inc {
    ($stats:expr, $field:ident) => {
        $stats.$field = $stats.$field.wrapping_add(1)
    };
}


#[cfg(test)]
mod tests {
    stats! {
        struct TestStats {
            first,
            second,
        }
    }

    #[test]
    fn counters_wrap_and_are_visited_in_order() {
        let mut stats = TestStats::default();
        stats.second = u32::MAX;
        stat_inc!(stats, second);
        stat_inc!(stats, first);

        let mut seen = [("", 0u32); 2];
        let mut i = 0;
        stats.for_each(|name, value| {
            seen[i] = (name, value);
            i += 1;
        });

        assert_eq!(seen, [("first", 1), ("second", 0)]);
        assert_eq!(stats.get("third"), None);
    }
}
