//! JVM binding for the secret store.
//!
//! Exposes the three store operations to `io.secretmem.SecretStore`.
//! Byte buffers cross the boundary as `byte[]`; an absent secret is a
//! Java `null`; every core error is re-raised as a `RuntimeException`
//! carrying the error's display string.

use std::ptr;

use jni::objects::{JClass, JString};
use jni::sys::{jbyteArray, jint};
use jni::JNIEnv;

use secretmem::SecretStore;

const ERROR_CLASS: &str = "java/lang/RuntimeException";

fn throw(env: &JNIEnv, message: impl std::fmt::Display) {
    let _ = env.throw_new(ERROR_CLASS, message.to_string());
}

fn store_name(env: &JNIEnv, j_name: JString) -> Option<String> {
    match env.get_string(j_name) {
        Ok(name) => Some(name.into()),
        Err(err) => {
            throw(env, err);
            None
        }
    }
}

fn byte_argument(env: &JNIEnv, array: jbyteArray) -> Option<Vec<u8>> {
    match env.convert_byte_array(array) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            throw(env, err);
            None
        }
    }
}

/// `byte[] read(String name, byte[] id)` — null when the id is absent.
#[no_mangle]
pub extern "system" fn Java_io_secretmem_SecretStore_read(
    env: JNIEnv,
    _class: JClass,
    j_name: JString,
    j_id: jbyteArray,
) -> jbyteArray {
    let name = match store_name(&env, j_name) {
        Some(name) => name,
        None => return ptr::null_mut(),
    };
    let id = match byte_argument(&env, j_id) {
        Some(id) => id,
        None => return ptr::null_mut(),
    };

    match SecretStore::new().read(&name, &id) {
        Ok(Some(secret)) => env.byte_array_from_slice(&secret).unwrap_or_else(|err| {
            throw(&env, err);
            ptr::null_mut()
        }),
        Ok(None) => ptr::null_mut(),
        Err(err) => {
            throw(&env, err);
            ptr::null_mut()
        }
    }
}

/// `void write(String name, byte[] id, byte[] secret, int perms)` — a
/// null or empty secret deletes the id.
#[no_mangle]
pub extern "system" fn Java_io_secretmem_SecretStore_write(
    env: JNIEnv,
    _class: JClass,
    j_name: JString,
    j_id: jbyteArray,
    j_secret: jbyteArray,
    j_perms: jint,
) {
    let name = match store_name(&env, j_name) {
        Some(name) => name,
        None => return,
    };
    let id = match byte_argument(&env, j_id) {
        Some(id) => id,
        None => return,
    };
    let secret = if j_secret.is_null() {
        None
    } else {
        match byte_argument(&env, j_secret) {
            Some(secret) => Some(secret),
            None => return,
        }
    };

    let outcome = SecretStore::new().write(&name, &id, secret.as_deref(), j_perms as u32);
    if let Err(err) = outcome {
        throw(&env, err);
    }
}

/// `void clear(String name, int perms)`.
#[no_mangle]
pub extern "system" fn Java_io_secretmem_SecretStore_clear(
    env: JNIEnv,
    _class: JClass,
    j_name: JString,
    j_perms: jint,
) {
    let name = match store_name(&env, j_name) {
        Some(name) => name,
        None => return,
    };
    if let Err(err) = SecretStore::new().clear(&name, j_perms as u32) {
        throw(&env, err);
    }
}
