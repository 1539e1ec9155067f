//! OS-specific or OS-dependent APIs.

#[cfg(feature = "std")]
mod std;
#[cfg(feature = "std")]
pub use self::std::{
    spawn, Arc, Box, Condvar, CvarMutex, CvarMutexGuard, HashMap, HashSet, JoinHandle, Mutex,
    MutexGuard, String, ToString, Vec, Weak,
};
